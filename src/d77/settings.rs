//! Synthesizer configuration blocks.
//!
//! [`Settings`] and [`Parameters`] are handed to the loaded image by address,
//! so their layouts are fixed: fifteen 32-bit fields (4-byte packing) and six
//! 16-bit fields (2-byte packing) respectively.

use crate::{Error, Result};

/// `D77_SETINGS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Settings {
    pub sampling_freq: u32,
    pub polyphony: u32,
    pub cpu_load_low: u32,
    pub cpu_load_high: u32,
    pub reverb_enabled: u32,
    pub chorus_enabled: u32,
    pub master_volume: u32,
    pub reverb_adjust: u32,
    pub chorus_adjust: u32,
    pub output_level: u32,
    pub reverb_feedback: u32,
    pub reverb_drum: u32,
    pub reso_up_adjust: u32,
    pub cache_size: u32,
    pub time_reso: u32,
}

const _: () = assert!(std::mem::size_of::<Settings>() == 60);
const _: () = assert!(std::mem::align_of::<Settings>() == 4);

impl Default for Settings {
    /// The values shipped in the synthesizer's .ini file.
    fn default() -> Self {
        Self {
            sampling_freq: 44100,
            polyphony: 64,
            cpu_load_low: 60,
            cpu_load_high: 90,
            reverb_enabled: 1,
            chorus_enabled: 1,
            master_volume: 100,
            reverb_adjust: 95,
            chorus_adjust: 70,
            output_level: 110,
            reverb_feedback: 95,
            reverb_drum: 80,
            reso_up_adjust: 40,
            cache_size: 3,
            time_reso: 80,
        }
    }
}

impl Settings {
    pub const SIZE: usize = std::mem::size_of::<Settings>();

    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    fn fields(&self) -> [u32; 15] {
        [
            self.sampling_freq,
            self.polyphony,
            self.cpu_load_low,
            self.cpu_load_high,
            self.reverb_enabled,
            self.chorus_enabled,
            self.master_volume,
            self.reverb_adjust,
            self.chorus_adjust,
            self.output_level,
            self.reverb_feedback,
            self.reverb_drum,
            self.reso_up_adjust,
            self.cache_size,
            self.time_reso,
        ]
    }

    /// The in-memory image the synthesizer reads.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (chunk, value) in out.chunks_exact_mut(4).zip(self.fields()) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Decode the block back, e.g. after the synthesizer validated it in
    /// place. Returns `None` if `bytes` is too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE)?;
        let mut f = [0u32; 15];
        for (value, chunk) in f.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(Self {
            sampling_freq: f[0],
            polyphony: f[1],
            cpu_load_low: f[2],
            cpu_load_high: f[3],
            reverb_enabled: f[4],
            chorus_enabled: f[5],
            master_volume: f[6],
            reverb_adjust: f[7],
            chorus_adjust: f[8],
            output_level: f[9],
            reverb_feedback: f[10],
            reverb_drum: f[11],
            reso_up_adjust: f[12],
            cache_size: f[13],
            time_reso: f[14],
        })
    }
}

/// `D77_PARAMETERS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Parameters {
    pub chorus_adjust: u16,
    pub reverb_adjust: u16,
    pub reverb_drum: u16,
    pub reverb_feedback: u16,
    pub output_level: u16,
    pub reso_up_adjust: u16,
}

const _: () = assert!(std::mem::size_of::<Parameters>() == 12);
const _: () = assert!(std::mem::align_of::<Parameters>() == 2);

impl Parameters {
    pub const SIZE: usize = std::mem::size_of::<Parameters>();

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.chorus_adjust,
            self.reverb_adjust,
            self.reverb_drum,
            self.reverb_feedback,
            self.output_level,
            self.reso_up_adjust,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, value) in out.chunks_exact_mut(2).zip(fields) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

impl From<&Settings> for Parameters {
    fn from(s: &Settings) -> Self {
        Self {
            chorus_adjust: s.chorus_adjust as u16,
            reverb_adjust: s.reverb_adjust as u16,
            reverb_drum: s.reverb_drum as u16,
            reverb_feedback: s.reverb_feedback as u16,
            output_level: s.output_level as u16,
            reso_up_adjust: s.reso_up_adjust as u16,
        }
    }
}

/// Builds [`Settings`], rejecting values outside the documented ranges.
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

fn check(name: &'static str, value: u32, ok: bool) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidSetting { name, value })
    }
}

impl SettingsBuilder {
    pub fn sampling_freq(&mut self, hz: u32) -> Result<&mut Self> {
        check("sampling frequency", hz, hz == 22050 || hz == 44100)?;
        self.settings.sampling_freq = hz;
        Ok(self)
    }

    pub fn polyphony(&mut self, voices: u32) -> Result<&mut Self> {
        check("polyphony", voices, (8..=256).contains(&voices))?;
        self.settings.polyphony = voices;
        Ok(self)
    }

    pub fn cpu_load_low(&mut self, percent: u32) -> Result<&mut Self> {
        check("cpu load", percent, (20..=85).contains(&percent))?;
        self.settings.cpu_load_low = percent;
        if self.settings.cpu_load_high < percent {
            self.settings.cpu_load_high = percent;
        }
        Ok(self)
    }

    pub fn cpu_load_high(&mut self, percent: u32) -> Result<&mut Self> {
        check(
            "cpu load high",
            percent,
            (self.settings.cpu_load_low..=100).contains(&percent),
        )?;
        self.settings.cpu_load_high = percent;
        Ok(self)
    }

    pub fn reverb(&mut self, enabled: bool) -> &mut Self {
        self.settings.reverb_enabled = u32::from(enabled);
        self
    }

    pub fn chorus(&mut self, enabled: bool) -> &mut Self {
        self.settings.chorus_enabled = u32::from(enabled);
        self
    }

    pub fn master_volume(&mut self, volume: u32) -> Result<&mut Self> {
        check("master volume", volume, volume <= 200)?;
        self.settings.master_volume = volume;
        Ok(self)
    }

    pub fn reverb_adjust(&mut self, value: u32) -> Result<&mut Self> {
        check("reverb adjust", value, value <= 200)?;
        self.settings.reverb_adjust = value;
        Ok(self)
    }

    pub fn chorus_adjust(&mut self, value: u32) -> Result<&mut Self> {
        check("chorus adjust", value, value <= 200)?;
        self.settings.chorus_adjust = value;
        Ok(self)
    }

    pub fn output_level(&mut self, value: u32) -> Result<&mut Self> {
        check("output level", value, value <= 200)?;
        self.settings.output_level = value;
        Ok(self)
    }

    pub fn reverb_feedback(&mut self, value: u32) -> Result<&mut Self> {
        check("reverb feedback", value, value <= 200)?;
        self.settings.reverb_feedback = value;
        Ok(self)
    }

    pub fn reverb_drum(&mut self, value: u32) -> Result<&mut Self> {
        check("reverb drum", value, value <= 200)?;
        self.settings.reverb_drum = value;
        Ok(self)
    }

    pub fn reso_up_adjust(&mut self, value: u32) -> Result<&mut Self> {
        check("resonance adjust", value, value <= 100)?;
        self.settings.reso_up_adjust = value;
        Ok(self)
    }

    pub fn cache_size(&mut self, value: u32) -> Result<&mut Self> {
        check("cache size", value, (1..=20).contains(&value))?;
        self.settings.cache_size = value;
        Ok(self)
    }

    pub fn time_reso(&mut self, value: u32) -> Result<&mut Self> {
        check("time resolution", value, value == 40 || value == 80)?;
        self.settings.time_reso = value;
        Ok(self)
    }

    pub fn build(&self) -> Settings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_field_order() {
        let s = Settings::default();
        let bytes = s.to_bytes();
        assert_eq!(&bytes[0..4], &44100u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &64u32.to_le_bytes());
        assert_eq!(&bytes[56..60], &80u32.to_le_bytes());
        assert_eq!(Settings::from_bytes(&bytes), Some(s));
        assert_eq!(Settings::from_bytes(&bytes[..59]), None);
    }

    #[test]
    fn test_parameters_from_settings() {
        let p = Parameters::from(&Settings::default());
        assert_eq!(
            p,
            Parameters {
                chorus_adjust: 70,
                reverb_adjust: 95,
                reverb_drum: 80,
                reverb_feedback: 95,
                output_level: 110,
                reso_up_adjust: 40,
            }
        );
        let bytes = p.to_bytes();
        assert_eq!(&bytes[0..2], &70u16.to_le_bytes());
        assert_eq!(&bytes[10..12], &40u16.to_le_bytes());
    }

    #[test]
    fn test_builder_accepts_boundaries() {
        let s = Settings::builder()
            .sampling_freq(22050)
            .and_then(|b| b.polyphony(256))
            .and_then(|b| b.master_volume(0))
            .and_then(|b| b.reso_up_adjust(100))
            .and_then(|b| b.cpu_load_low(85))
            .map(|b| b.reverb(false))
            .unwrap()
            .build();
        assert_eq!(s.sampling_freq, 22050);
        assert_eq!(s.polyphony, 256);
        assert_eq!(s.master_volume, 0);
        assert_eq!(s.cpu_load_low, 85);
        assert_eq!(s.cpu_load_high, 90);
        assert_eq!(s.reverb_enabled, 0);
    }

    #[test]
    fn test_rejected_value_keeps_previous() {
        let mut builder = Settings::builder();
        builder.master_volume(150).unwrap();
        assert!(builder.master_volume(250).is_err());
        assert_eq!(builder.build().master_volume, 150);
    }

    #[test]
    fn test_builder_rejects_out_of_range() {
        assert!(matches!(
            Settings::builder().sampling_freq(48000),
            Err(Error::InvalidSetting { value: 48000, .. })
        ));
        assert!(Settings::builder().polyphony(7).is_err());
        assert!(Settings::builder().master_volume(201).is_err());
        assert!(Settings::builder().reso_up_adjust(101).is_err());
        assert!(Settings::builder().cpu_load_low(19).is_err());
        assert!(Settings::builder().cpu_load_high(59).is_err());
        assert!(Settings::builder().time_reso(60).is_err());
        assert!(Settings::builder().cache_size(0).is_err());
    }
}
