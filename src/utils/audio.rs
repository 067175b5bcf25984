/// Container formats the speech service is known to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Unknown,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Unknown => "bin",
        }
    }
}

/// Guesses the container from its magic bytes.
pub fn sniff_format(bytes: &[u8]) -> AudioFormat {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return AudioFormat::Wav;
    }
    if bytes.starts_with(b"OggS") {
        return AudioFormat::Ogg;
    }
    if bytes.starts_with(b"ID3") {
        return AudioFormat::Mp3;
    }
    // Bare MPEG frame sync.
    if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
        return AudioFormat::Mp3;
    }
    AudioFormat::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_format() {
        assert_eq!(sniff_format(b"RIFF\x24\x00\x00\x00WAVEfmt "), AudioFormat::Wav);
        assert_eq!(sniff_format(b"RIFF"), AudioFormat::Unknown);
        assert_eq!(sniff_format(b"OggS\x00\x02"), AudioFormat::Ogg);
        assert_eq!(sniff_format(b"ID3\x04\x00"), AudioFormat::Mp3);
        assert_eq!(sniff_format(&[0xFF, 0xFB, 0x90, 0x64]), AudioFormat::Mp3);
        assert_eq!(sniff_format(b""), AudioFormat::Unknown);
        assert_eq!(AudioFormat::Unknown.extension(), "bin");
    }
}
