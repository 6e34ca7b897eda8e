//! The one-time pre-key release policy: decides, after a device has used a bound OTPK, whether
//! it is safe to discard it yet.
//!
//! Grounded in `original_source/omemo/otpkpolicy.py` (the `decideOTPK` interface) and
//! `original_source/omemo/defaultotpkpolicy.py` (the shipped default ruleset, spec section 4.2).

use serde::{Deserialize, Serialize};

/// One recorded use of a bound one-time pre key: when the initial pre-key message referencing
/// it arrived, whether it came from a storage/replay mechanism (e.g. MAM) rather than a live
/// delivery, and the timestamps of every reply we have since sent to that device while the OTPK
/// stayed bound.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyMessageEvent {
    pub timestamp: u64,
    pub from_storage: bool,
    pub answers: Vec<u64>,
}

impl PreKeyMessageEvent {
    pub fn new(timestamp: u64, from_storage: bool) -> Self {
        Self { timestamp, from_storage, answers: Vec::new() }
    }
}

/// Decides whether a bound one-time pre key may be released. Implementors trade off usability
/// (tolerating late or duplicated initial messages, e.g. delivered out of order via MAM) against
/// security (bounding how long a single OTPK can be replayed).
pub trait OtpkPolicy: Send + Sync {
    /// Returns `true` to keep the OTPK bound, `false` to release it.
    fn keep(&self, events: &[PreKeyMessageEvent]) -> bool;
}

/// The default policy shipped with the crate: never release an OTPK used only via storage
/// replay, never release before at least one live reply has been sent, and only release once at
/// least two replies have been sent with at least 24 hours between the earliest and the latest.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOtpkPolicy;

const RELEASE_MIN_ANSWERS: usize = 2;
const RELEASE_MIN_SPAN_SECONDS: u64 = 24 * 60 * 60;

impl OtpkPolicy for DefaultOtpkPolicy {
    fn keep(&self, events: &[PreKeyMessageEvent]) -> bool {
        let answers: Vec<u64> = events
            .iter()
            .filter(|event| !event.from_storage)
            .flat_map(|event| event.answers.iter().copied())
            .collect();

        if answers.len() < RELEASE_MIN_ANSWERS {
            return true;
        }

        let min = *answers.iter().min().expect("checked non-empty above");
        let max = *answers.iter().max().expect("checked non-empty above");
        max - min < RELEASE_MIN_SPAN_SECONDS
    }
}
