//! FfmpegProgressParser - ffmpeg のステータス行を解析

use regex::Regex;

use crate::ports::{ProgressEvent, ProgressParser};

/// Reads ffmpeg status lines.
///
/// Video status lines carry `frame=` and `fps=`; audio-only ones just
/// `time=` and `speed=`, so audio progress is counted in whole seconds.
pub struct FfmpegProgressParser {
    frame: Regex,
    fps: Regex,
    time: Regex,
    speed: Regex,
    missing_codec: Regex,
}

impl FfmpegProgressParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            frame: Regex::new(r"frame=\s*(\d+)")?,
            fps: Regex::new(r"fps=\s*(\d+(?:\.\d+)?)")?,
            time: Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")?,
            speed: Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x")?,
            missing_codec: Regex::new(
                r"(Unknown encoder '[^']+'|Unknown decoder '[^']+'|Decoder \([^)]*\) not found|Encoder \([^)]*\) not found)",
            )?,
        })
    }

    fn seconds(&self, line: &str) -> Option<u64> {
        let caps = self.time.captures(line)?;
        let hours: u64 = caps[1].parse().ok()?;
        let minutes: u64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        Some(hours * 3600 + minutes * 60 + seconds.floor() as u64)
    }
}

impl ProgressParser for FfmpegProgressParser {
    fn parse(&self, line: &str) -> ProgressEvent {
        if let Some(m) = self.missing_codec.find(line) {
            return ProgressEvent::MissingDecoder(m.as_str().to_string());
        }

        if let Some(caps) = self.frame.captures(line) {
            let Ok(frames) = caps[1].parse::<u64>() else {
                return ProgressEvent::None;
            };
            let fps = self
                .fps
                .captures(line)
                .and_then(|c| c[1].parse::<f64>().ok());
            return match fps {
                Some(speed) => ProgressEvent::UnitsAndSpeed {
                    units: frames,
                    speed,
                },
                None => ProgressEvent::Units(frames),
            };
        }

        match self.seconds(line) {
            Some(seconds) => {
                let speed = self
                    .speed
                    .captures(line)
                    .and_then(|c| c[1].parse::<f64>().ok());
                match speed {
                    Some(speed) => ProgressEvent::UnitsAndSpeed {
                        units: seconds,
                        speed,
                    },
                    None => ProgressEvent::Units(seconds),
                }
            }
            None => ProgressEvent::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        "frame=  240 fps= 48 q=28.0 size=    1024kB time=00:00:10.00 bitrate= 838.9kbits/s speed=2.0x",
        ProgressEvent::UnitsAndSpeed { units: 240, speed: 48.0 }
    )]
    #[case("frame=12", ProgressEvent::Units(12))]
    #[case(
        "size=     512kB time=00:01:05.48 bitrate=  64.0kbits/s speed=12.5x",
        ProgressEvent::UnitsAndSpeed { units: 65, speed: 12.5 }
    )]
    #[case("size=     512kB time=01:00:00.00 bitrate=  64.0kbits/s", ProgressEvent::Units(3600))]
    #[case(
        "Unknown encoder 'libx265'",
        ProgressEvent::MissingDecoder("Unknown encoder 'libx265'".to_string())
    )]
    #[case(
        "Decoder (codec av1) not found for input stream #0:0",
        ProgressEvent::MissingDecoder("Decoder (codec av1) not found".to_string())
    )]
    #[case("Input #0, matroska,webm, from 'source.mkv':", ProgressEvent::None)]
    #[case("", ProgressEvent::None)]
    fn parses_status_lines(#[case] line: &str, #[case] expected: ProgressEvent) {
        let parser = FfmpegProgressParser::new().unwrap();
        assert_eq!(parser.parse(line), expected);
    }
}
