//! Delay based estimation: arrival groups, trendline detector and AIMD rate control.

mod arrival_group;
mod control;
mod rate_control;
mod trendline;

pub(crate) use control::{DelayController, DelayResult};
