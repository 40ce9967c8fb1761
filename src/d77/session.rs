//! Synthesizer start-up and the render loop buffers.

use super::{Effect, Parameters, Settings, Synth};
use crate::mmap::MappedFile;
use crate::sys::LowMemory;
use crate::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Size of the buffer long MIDI messages are staged in.
pub const LONG_MESSAGE_BUFFER: usize = 65536;

/// Locate the data file. If `path` does not exist, its directory is searched
/// for an entry whose name matches ignoring ASCII case.
pub fn find_data_file(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    let not_found = || {
        Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("data file {} not found", path.display()),
        ))
    };
    let name = path.file_name().ok_or_else(not_found)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().eq_ignore_ascii_case(name) {
            debug!("Using data file {}", entry.path().display());
            return Ok(entry.path());
        }
    }
    Err(not_found())
}

/// An initialized synthesizer with its data file and I/O buffers.
pub struct Session<'a> {
    synth: &'a Synth,
    settings: Settings,
    samples_per_call: u32,
    _data: LowMemory,
    input: LowMemory,
    output: LowMemory,
}

impl<'a> Session<'a> {
    /// Validate `settings`, load the data file at `data_path` and initialize
    /// every part of the synthesizer in the order it expects.
    pub fn start(synth: &'a Synth, settings: Settings, data_path: &Path) -> Result<Self> {
        let space = synth.space().clone();

        let path = find_data_file(data_path)?;
        let file = MappedFile::open(&path)?;
        if file.len() <= 4 {
            error!("{}: data file is too short", path.display());
            return Err(io::Error::new(io::ErrorKind::InvalidData, "data file is too short").into());
        }
        let mut data = LowMemory::new(&space, file.len())?;
        data.as_mut_slice().copy_from_slice(file.data());
        drop(file);

        // settings and parameters pass through the message buffer
        let mut input = LowMemory::new(&space, LONG_MESSAGE_BUFFER)?;
        let input_addr = input.guest_addr()?;
        input.as_mut_slice()[..Settings::SIZE].copy_from_slice(&settings.to_bytes());
        synth.validate_settings(input_addr)?;
        let settings = Settings::from_bytes(input.as_slice()).unwrap_or(settings);
        debug!("Validated settings: {:?}", settings);

        if !synth.initialize_data_file(data.guest_addr()?, (data.len() - 4) as u32)? {
            error!("error initializing data file");
            return Err(Error::Rejected("data file"));
        }
        if !synth.initialize_synth(settings.sampling_freq, settings.polyphony, settings.time_reso)? {
            error!("error initializing synth");
            return Err(Error::Rejected("synth initialization"));
        }
        synth.initialize_unknown(0)?;
        synth.initialize_effect(Effect::Reverb, settings.reverb_enabled != 0)?;
        synth.initialize_effect(Effect::Chorus, settings.chorus_enabled != 0)?;
        synth.initialize_cpu_load(settings.cpu_load_low, settings.cpu_load_high)?;

        let parameters = Parameters::from(&settings);
        input.as_mut_slice()[..Parameters::SIZE].copy_from_slice(&parameters.to_bytes());
        synth.initialize_parameters(input_addr)?;
        synth.initialize_master_volume(settings.master_volume)?;

        let samples_per_call = synth.rendered_samples_per_call()?;
        if samples_per_call == 0 {
            return Err(Error::Rejected("zero samples per call"));
        }
        let output = LowMemory::new(&space, samples_per_call as usize * 2 * size_of::<i16>())?;
        debug!(
            "Session started: {} Hz, {} samples per call",
            settings.sampling_freq, samples_per_call
        );

        Ok(Self {
            synth,
            settings,
            samples_per_call,
            _data: data,
            input,
            output,
        })
    }

    /// The settings as left by the synthesizer's validation.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sampling_freq(&self) -> u32 {
        self.settings.sampling_freq
    }

    pub fn samples_per_call(&self) -> u32 {
        self.samples_per_call
    }

    pub fn short_message(&mut self, message: u32) -> Result<u32> {
        self.synth.midi_message_short(message)
    }

    /// Send a system-exclusive or other long message.
    pub fn long_message(&mut self, message: &[u8]) -> Result<u32> {
        if message.len() > LONG_MESSAGE_BUFFER {
            warn!("Dropping {} byte MIDI message", message.len());
            return Err(Error::InvalidSetting {
                name: "long message length",
                value: message.len() as u32,
            });
        }
        self.input.as_mut_slice()[..message.len()].copy_from_slice(message);
        self.synth
            .midi_message_long(self.input.guest_addr()?, message.len() as u32)
    }

    /// Render the next block of interleaved stereo samples.
    pub fn render(&mut self) -> Result<&[i16]> {
        if !self.synth.render_samples(self.output.guest_addr()?)? {
            error!("error rendering samples");
            return Err(Error::Rejected("render"));
        }
        let frames = self.samples_per_call as usize * 2;
        // SAFETY: the buffer was allocated for exactly this many samples and
        // mappings are page aligned.
        let samples = unsafe { std::slice::from_raw_parts(self.output.as_ptr() as *const i16, frames) };
        Ok(samples)
    }
}
