//! Local and remote SETTINGS with synchronous ACK tracking (RFC 7540 §6.5).

use crate::{
    error::SettingsError,
    types::{SettingsParameter, DEFAULT_MAX_FRAME_SIZE, MAX_ALLOWED_FRAME_SIZE, MAX_WINDOW_SIZE},
};
use enum_map::{enum_map, EnumMap};
use std::collections::VecDeque;

fn defaults() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => 4096,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => 65_535,
        SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

/// Both endpoints' settings. Locally sent SETTINGS only take effect once the
/// peer acknowledges them, so unacked batches queue in send order.
#[derive(Debug)]
pub struct SettingsStore {
    local: EnumMap<SettingsParameter, u32>,
    remote: EnumMap<SettingsParameter, u32>,
    unacked: VecDeque<Vec<(SettingsParameter, u32)>>,
}

impl SettingsStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            local: defaults(),
            remote: defaults(),
            unacked: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn local(&self, param: SettingsParameter) -> u32 {
        self.local[param]
    }

    #[must_use]
    pub fn remote(&self, param: SettingsParameter) -> u32 {
        self.remote[param]
    }

    /// Records a locally sent SETTINGS frame awaiting acknowledgment.
    pub fn sent(&mut self, params: Vec<(SettingsParameter, u32)>) {
        self.unacked.push_back(params);
    }

    #[must_use]
    pub fn awaiting_ack(&self) -> bool {
        !self.unacked.is_empty()
    }

    /// Applies the oldest unacked batch, returning each parameter with its
    /// previous and new value so the caller can react (decoder capacity,
    /// stream receive-window deltas, frame-size checks).
    pub fn acked(&mut self) -> Result<Vec<(SettingsParameter, u32, u32)>, SettingsError> {
        let params = self.unacked.pop_front().ok_or(SettingsError::UnexpectedAck)?;
        let mut applied = Vec::with_capacity(params.len());
        for (param, value) in params {
            applied.push((param, self.local[param], value));
            self.local[param] = value;
        }
        Ok(applied)
    }

    /// Validates and applies a peer SETTINGS frame, returning each changed
    /// parameter with its previous value.
    pub fn apply_remote(
        &mut self,
        params: &[(SettingsParameter, u32)],
    ) -> Result<Vec<(SettingsParameter, u32, u32)>, SettingsError> {
        for &(param, value) in params {
            match param {
                SettingsParameter::EnablePush if value > 1 => {
                    return Err(SettingsError::InvalidEnablePush(value));
                }
                SettingsParameter::InitialWindowSize if value > MAX_WINDOW_SIZE => {
                    return Err(SettingsError::WindowTooLarge(value));
                }
                SettingsParameter::MaxFrameSize
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&value) =>
                {
                    return Err(SettingsError::FrameSizeOutOfRange(value));
                }
                _ => {}
            }
        }
        let mut changed = Vec::with_capacity(params.len());
        for &(param, value) in params {
            let old = self.remote[param];
            self.remote[param] = value;
            if old != value {
                changed.push((param, old, value));
            }
        }
        Ok(changed)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}
