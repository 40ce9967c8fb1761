//! 16-bit stereo PCM WAV output.

use std::io::{self, Seek, SeekFrom, Write};

const HEADER_LEN: u32 = 44;
const CHANNELS: u16 = 2;
const BITS_PER_SAMPLE: u16 = 16;
const BLOCK_ALIGN: u16 = CHANNELS * BITS_PER_SAMPLE / 8;

/// Streams interleaved stereo samples into a RIFF/WAVE container.
///
/// The header is written up front with zero lengths; [`finish`](Self::finish)
/// patches the RIFF and data chunk lengths.
pub struct WavWriter<W: Write + Seek> {
    out: W,
    data_len: u32,
}

impl<W: Write + Seek> WavWriter<W> {
    pub fn new(mut out: W, sample_rate: u32) -> io::Result<Self> {
        out.write_all(b"RIFF")?;
        out.write_all(&(HEADER_LEN - 8).to_le_bytes())?;
        out.write_all(b"WAVE")?;

        out.write_all(b"fmt ")?;
        out.write_all(&16u32.to_le_bytes())?;
        out.write_all(&1u16.to_le_bytes())?; // PCM
        out.write_all(&CHANNELS.to_le_bytes())?;
        out.write_all(&sample_rate.to_le_bytes())?;
        out.write_all(&(sample_rate * u32::from(BLOCK_ALIGN)).to_le_bytes())?;
        out.write_all(&BLOCK_ALIGN.to_le_bytes())?;
        out.write_all(&BITS_PER_SAMPLE.to_le_bytes())?;

        out.write_all(b"data")?;
        out.write_all(&0u32.to_le_bytes())?;
        Ok(Self { out, data_len: 0 })
    }

    /// Append interleaved left/right samples.
    pub fn write_samples(&mut self, samples: &[i16]) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.out.write_all(&bytes)?;
        self.data_len = self.data_len.wrapping_add(bytes.len() as u32);
        Ok(())
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    /// Patch the chunk lengths and hand back the writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.seek(SeekFrom::Start(4))?;
        self.out
            .write_all(&(HEADER_LEN - 8 + self.data_len).to_le_bytes())?;
        self.out.seek(SeekFrom::Start(40))?;
        self.out.write_all(&self.data_len.to_le_bytes())?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;
        Ok(self.out)
    }
}
