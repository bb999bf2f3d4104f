//! Device manager shared by every voice session
//!
//! Owns the exclusive microphone lease and the single output path. At most
//! one session can hold the microphone at a time; the output path is
//! initialized once and reused across sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::capture::InputBackend;
use super::cpal_backend::{CpalInput, CpalOutput};
use super::playback::{OutputBackend, PlaybackScheduler};
use super::AudioError;

/// Explicit owner of the audio hardware.
pub struct AudioDevices {
    input: Arc<dyn InputBackend>,
    microphone: MicrophoneGate,
    playback: PlaybackScheduler,
}

impl AudioDevices {
    pub fn new(input: Arc<dyn InputBackend>, output: Arc<dyn OutputBackend>) -> Self {
        Self {
            input,
            microphone: MicrophoneGate::default(),
            playback: PlaybackScheduler::new(output),
        }
    }

    /// Devices backed by the default cpal host.
    pub fn system() -> Self {
        Self::new(Arc::new(CpalInput), Arc::new(CpalOutput))
    }

    pub fn input_backend(&self) -> Arc<dyn InputBackend> {
        self.input.clone()
    }

    /// Handle used by capture engines to take the microphone lease.
    pub fn microphone(&self) -> MicrophoneGate {
        self.microphone.clone()
    }

    pub fn microphone_in_use(&self) -> bool {
        self.microphone.in_use()
    }

    /// The shared playback scheduler. All clones drive the same output path.
    pub fn playback(&self) -> PlaybackScheduler {
        self.playback.clone()
    }
}

/// Grants at most one `MicrophoneLease` at a time.
#[derive(Clone, Default)]
pub struct MicrophoneGate {
    held: Arc<AtomicBool>,
}

impl MicrophoneGate {
    pub fn acquire(&self) -> Result<MicrophoneLease, AudioError> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                AudioError::DeviceUnavailable("microphone is held by another session".to_string())
            })?;
        log::debug!("Devices: microphone lease acquired");
        Ok(MicrophoneLease {
            held: self.held.clone(),
        })
    }

    pub fn in_use(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Exclusive claim on the microphone. Released on drop.
pub struct MicrophoneLease {
    held: Arc<AtomicBool>,
}

impl Drop for MicrophoneLease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
        log::debug!("Devices: microphone lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive() {
        let gate = MicrophoneGate::default();
        let lease = gate.acquire().unwrap();
        assert!(gate.in_use());
        assert!(matches!(
            gate.acquire(),
            Err(AudioError::DeviceUnavailable(_))
        ));

        drop(lease);
        assert!(!gate.in_use());
        assert!(gate.acquire().is_ok());
    }
}
