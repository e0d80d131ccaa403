//! Renewal timing for leaf certificates.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use kilngrid_state::CertificateInfo;

/// When a certificate valid over `[not_before, not_after]` should be
/// reissued.
///
/// Normally `not_after - renew_window`. A certificate whose whole validity
/// is shorter than the window renews at `not_after - 0.8 * validity`
/// instead, so it is not due the moment it is issued. Never earlier than
/// `not_before`.
pub fn renewal_time(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    renew_window: Duration,
) -> DateTime<Utc> {
    let validity = not_after.signed_duration_since(not_before);
    let window = TimeDelta::from_std(renew_window).unwrap_or(TimeDelta::MAX);

    let lead = if validity < window {
        TimeDelta::milliseconds(validity.num_milliseconds() * 8 / 10)
    } else {
        window
    };

    not_after
        .checked_sub_signed(lead)
        .unwrap_or(not_before)
        .max(not_before)
}

/// Whether a certificate must be reissued at `now`.
///
/// Missing metadata always rotates. Stored renewal times win over the
/// recomputed one so a change of window does not reshuffle every pool.
pub fn should_rotate(info: Option<&CertificateInfo>, renew_window: Duration, now: DateTime<Utc>) -> bool {
    let Some(info) = info else {
        return true;
    };
    let due = info
        .renewal_time
        .unwrap_or_else(|| renewal_time(info.not_before, info.not_after, renew_window));
    now >= due
}
