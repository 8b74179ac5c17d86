//! Compatibility fallback ladder.
//!
//! When an encoder refuses a profile the manager walks down this ladder
//! until something initialises: first shed refresh rate, then resolution,
//! finally fall back to the explicit degraded profile.

use expandscreen_core::VideoProfile;

/// Build the ordered, deduplicated ladder for `base`.
pub fn fallback_ladder(base: VideoProfile, degraded: VideoProfile) -> Vec<VideoProfile> {
    let mut ladder: Vec<VideoProfile> = Vec::new();
    let mut push = |ladder: &mut Vec<VideoProfile>, profile: VideoProfile| {
        if !ladder.contains(&profile) {
            ladder.push(profile);
        }
    };

    push(&mut ladder, base);
    if base.refresh_rate > 60 {
        push(&mut ladder, base.with_refresh_rate(60));
    }
    if base.refresh_rate > 30 {
        push(&mut ladder, base.with_refresh_rate(30));
    }

    for (max_w, max_h) in [(1920u32, 1080u32), (1280, 720)] {
        if let Some(scaled) = base.scaled_to_fit(max_w, max_h) {
            push(&mut ladder, scaled);
            if scaled.refresh_rate > 60 {
                push(&mut ladder, scaled.with_refresh_rate(60));
            }
            if scaled.refresh_rate > 30 {
                push(&mut ladder, scaled.with_refresh_rate(30));
            }
        }
    }

    push(&mut ladder, degraded);
    if degraded.refresh_rate > 30 {
        push(&mut ladder, degraded.with_refresh_rate(30));
    }

    ladder
}
