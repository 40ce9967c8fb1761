//! The synthesizer facade.
//!
//! [`Synth`] owns a loaded synthesizer image and the addresses of its twelve
//! entry points. Each method marshals its arguments into the `__fastcall`
//! convention on the calling thread's execution context and returns what the
//! image leaves in EAX. Pointer arguments are window-relative addresses of
//! [`LowMemory`](crate::sys::LowMemory) blocks.
//!
//! [`Session`] runs the host start-up sequence on top of it, and [`capi`]
//! exposes the same operations with C linkage.

pub mod capi;
mod session;
mod settings;

pub use session::{LONG_MESSAGE_BUFFER, Session, find_data_file};
pub use settings::{Parameters, Settings, SettingsBuilder};

use crate::loader::{Library, Loader};
use crate::runtime;
use crate::sys::AddressSpace;
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Effect selector for [`Synth::initialize_effect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Effect {
    Chorus = 0,
    Reverb = 1,
}

impl TryFrom<u32> for Effect {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Effect::Chorus),
            1 => Ok(Effect::Reverb),
            _ => Err(Error::InvalidSetting {
                name: "effect",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Exports {
    validate_settings: u64,
    initialize_data_file: u64,
    initialize_synth: u64,
    initialize_unknown: u64,
    initialize_effect: u64,
    initialize_cpu_load: u64,
    initialize_parameters: u64,
    initialize_master_volume: u64,
    rendered_samples_per_call: u64,
    midi_message_short: u64,
    midi_message_long: u64,
    render_samples: u64,
}

impl Exports {
    fn resolve(library: &Library) -> Result<Self> {
        let get = |name: &'static str| library.find_symbol(name).ok_or(Error::MissingExport(name));
        Ok(Self {
            validate_settings: get("c_ValidateSettings_asm")?,
            initialize_data_file: get("c_InitializeDataFile_asm")?,
            initialize_synth: get("c_InitializeSynth_asm")?,
            initialize_unknown: get("c_InitializeUnknown_asm")?,
            initialize_effect: get("c_InitializeEffect_asm")?,
            initialize_cpu_load: get("c_InitializeCpuLoad_asm")?,
            initialize_parameters: get("c_InitializeParameters_asm")?,
            initialize_master_volume: get("c_InitializeMasterVolume_asm")?,
            rendered_samples_per_call: get("dwRenderedSamplesPerCall_asm")?,
            midi_message_short: get("c_MidiMessageShort_asm")?,
            midi_message_long: get("c_MidiMessageLong_asm")?,
            render_samples: get("c_RenderSamples_asm")?,
        })
    }
}

/// A loaded synthesizer library.
pub struct Synth {
    library: Library,
    exports: Exports,
}

impl Synth {
    /// Load the library at `path` into the process-wide low window.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(&Loader::default(), path)
    }

    pub fn load_with(loader: &Loader, path: impl AsRef<Path>) -> Result<Self> {
        Self::from_library(loader.load(path)?)
    }

    /// Resolve the entry points of an already loaded image. The image is
    /// unloaded if any of them is missing.
    pub fn from_library(library: Library) -> Result<Self> {
        let exports = Exports::resolve(&library).inspect_err(|err| {
            tracing::error!("{}: {}", library.path().display(), err);
        })?;
        debug!("Synthesizer entry points resolved in {}", library.path().display());
        Ok(Self { library, exports })
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        self.library.space()
    }

    fn call(&self, func: u64, ecx: u32, edx: u32, stack: &[u32]) -> Result<u32> {
        runtime::with_context(self.space(), |ctx| unsafe { ctx.fastcall(func, ecx, edx, stack) })?
    }

    pub fn validate_settings(&self, settings: u32) -> Result<()> {
        self.call(self.exports.validate_settings, settings, 0, &[])?;
        Ok(())
    }

    /// Hand the data file to the synthesizer; `len` excludes the trailing
    /// 4-byte checksum.
    pub fn initialize_data_file(&self, data: u32, len: u32) -> Result<bool> {
        Ok(self.call(self.exports.initialize_data_file, data, len, &[])? != 0)
    }

    pub fn initialize_synth(&self, sampling_freq: u32, polyphony: u32, time_reso: u32) -> Result<bool> {
        let eax = self.call(
            self.exports.initialize_synth,
            sampling_freq,
            polyphony,
            &[time_reso],
        )?;
        Ok(eax != 0)
    }

    pub fn initialize_unknown(&self, value: u32) -> Result<()> {
        self.call(self.exports.initialize_unknown, value, 0, &[])?;
        Ok(())
    }

    pub fn initialize_effect(&self, effect: Effect, enabled: bool) -> Result<()> {
        self.initialize_effect_id(effect as u32, enabled)
    }

    /// Like [`Synth::initialize_effect`] with the selector passed through
    /// unchecked; the library decides what an unknown id means.
    pub fn initialize_effect_id(&self, effect: u32, enabled: bool) -> Result<()> {
        self.call(
            self.exports.initialize_effect,
            effect,
            u32::from(enabled),
            &[],
        )?;
        Ok(())
    }

    pub fn initialize_cpu_load(&self, low: u32, high: u32) -> Result<()> {
        self.call(self.exports.initialize_cpu_load, low, high, &[])?;
        Ok(())
    }

    pub fn initialize_parameters(&self, parameters: u32) -> Result<()> {
        self.call(self.exports.initialize_parameters, parameters, 0, &[])?;
        Ok(())
    }

    pub fn initialize_master_volume(&self, volume: u32) -> Result<()> {
        self.call(self.exports.initialize_master_volume, volume, 0, &[])?;
        Ok(())
    }

    /// Stereo frames produced by each [`render_samples`](Self::render_samples).
    pub fn rendered_samples_per_call(&self) -> Result<u32> {
        self.library.read_u32(self.exports.rendered_samples_per_call)
    }

    /// Send a packed short MIDI message (status in the low byte).
    pub fn midi_message_short(&self, message: u32) -> Result<u32> {
        // second parameter is the unused MIDI port
        self.call(self.exports.midi_message_short, message, 0, &[])
    }

    pub fn midi_message_long(&self, message: u32, len: u32) -> Result<u32> {
        // third parameter is the unused MIDI port
        self.call(self.exports.midi_message_long, message, len, &[0])
    }

    /// Render one block of interleaved stereo `i16` samples into `output`.
    pub fn render_samples(&self, output: u32) -> Result<bool> {
        Ok(self.call(self.exports.render_samples, output, 0, &[])? != 0)
    }
}

impl std::fmt::Debug for Synth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synth").field("library", &self.library).finish()
    }
}
