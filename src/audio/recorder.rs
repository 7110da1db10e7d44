//! Debug recording of a session's audio as a WAV file.
//!
//! Clients can set `is_save_audio_file` to keep a copy of what they sent, which is the
//! quickest way to tell a client-side capture problem from an engine scoring problem.
//! Recording failures are never fatal to the session.
//!
//! Frames go to disk as they arrive. The RIFF header is written up front with zero sizes
//! and patched in [`AudioRecorder::finish`], so memory use does not grow with the length
//! of the session.

use super::processor::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

const HEADER_LEN: usize = 44;

/// Canonical 44-byte PCM WAV header for `data_len` bytes of samples.
fn wav_header(data_len: u32) -> io::Result<Vec<u8>> {
    let block_align = CHANNELS * (BITS_PER_SAMPLE / 8);
    let byte_rate = SAMPLE_RATE * u32::from(block_align);

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(b"RIFF");
    WriteBytesExt::write_u32::<LittleEndian>(&mut header, data_len.saturating_add(36))?;
    header.extend_from_slice(b"WAVEfmt ");
    WriteBytesExt::write_u32::<LittleEndian>(&mut header, 16)?;
    WriteBytesExt::write_u16::<LittleEndian>(&mut header, 1)?; // PCM
    WriteBytesExt::write_u16::<LittleEndian>(&mut header, CHANNELS)?;
    WriteBytesExt::write_u32::<LittleEndian>(&mut header, SAMPLE_RATE)?;
    WriteBytesExt::write_u32::<LittleEndian>(&mut header, byte_rate)?;
    WriteBytesExt::write_u16::<LittleEndian>(&mut header, block_align)?;
    WriteBytesExt::write_u16::<LittleEndian>(&mut header, BITS_PER_SAMPLE)?;
    header.extend_from_slice(b"data");
    WriteBytesExt::write_u32::<LittleEndian>(&mut header, data_len)?;
    Ok(header)
}

/// Streams aligned PCM frames into a WAV file.
#[derive(Debug)]
pub struct AudioRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    data_len: u32,
}

impl AudioRecorder {
    /// Create the file under `dir`, creating the directory if needed.
    ///
    /// File names look like `audio_20250101120000_<session>.wav`.
    pub async fn create(dir: &Path, session_id: &str, started_at: DateTime<Utc>) -> io::Result<Self> {
        fs::create_dir_all(dir).await?;
        let file_name = format!(
            "audio_{}_{}.wav",
            started_at.format("%Y%m%d%H%M%S"),
            session_id
        );
        let path = dir.join(file_name);

        let mut writer = BufWriter::new(File::create(&path).await?);
        writer.write_all(&wav_header(0)?).await?;

        Ok(Self {
            path,
            writer,
            data_len: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one aligned frame.
    pub async fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.write_all(frame).await?;
        let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
        self.data_len = self.data_len.saturating_add(len);
        Ok(())
    }

    /// Patch the header with the final sizes and return the file's path.
    pub async fn finish(mut self) -> io::Result<PathBuf> {
        self.writer.flush().await?;

        let mut file = self.writer.into_inner();
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&wav_header(self.data_len)?).await?;
        file.flush().await?;

        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = wav_header(6).unwrap();
        assert_eq!(header.len(), HEADER_LEN);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[4..8], &42u32.to_le_bytes());
        assert_eq!(&header[24..28], &16_000u32.to_le_bytes());
        assert_eq!(&header[28..32], &32_000u32.to_le_bytes());
        assert_eq!(&header[40..44], &6u32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_recorder_writes_readable_wav() {
        let dir = std::env::temp_dir().join(format!("assessment-rec-{}", uuid::Uuid::new_v4()));
        let started = Utc::now();

        let mut recorder = AudioRecorder::create(&dir, "session-1", started).await.unwrap();
        recorder.append(&[0x01, 0x00, 0x02, 0x00]).await.unwrap();
        recorder.append(&[0xff, 0x7f, 0x00, 0x00]).await.unwrap();

        let expected_name = format!("audio_{}_session-1.wav", started.format("%Y%m%d%H%M%S"));
        assert!(recorder.path().ends_with(&expected_name));

        let path = recorder.finish().await.unwrap();
        let mut file = std::fs::File::open(&path).unwrap();
        let (header, data) = wav::read(&mut file).unwrap();
        assert_eq!(header.sampling_rate, 16_000);
        assert_eq!(header.channel_count, 1);
        assert_eq!(data, wav::BitDepth::Sixteen(vec![1, 2, i16::MAX, 0]));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_empty_recording_is_still_valid() {
        let dir = std::env::temp_dir().join(format!("assessment-rec-{}", uuid::Uuid::new_v4()));

        let recorder = AudioRecorder::create(&dir, "silent", Utc::now()).await.unwrap();
        let path = recorder.finish().await.unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_LEN as u64);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
