//! FfmpegCommandBuilder - ffmpeg 用の最小 CommandBuilder
//!
//! 区間・ストリーム・パスだけを指定する。コーデックや品質は
//! エンコーダーの既定値と、ノードに設定した `extra_args` に任せる。

use std::path::PathBuf;

use crate::domain::{Task, TaskKind};
use crate::ports::CommandBuilder;

#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    binary: String,
    shared_folder: PathBuf,
    extra_args: Vec<String>,
}

impl FfmpegCommandBuilder {
    pub fn new(binary: impl Into<String>, shared_folder: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            shared_folder: shared_folder.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

fn seconds(ms: u64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

impl CommandBuilder for FfmpegCommandBuilder {
    fn build(&self, task: &Task, step: u32) -> Vec<String> {
        let source = self.shared_folder.join(&task.stream.source_file);
        let mut args = vec![
            self.binary.clone(),
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-ss".to_string(),
            seconds(task.start_ms),
            "-to".to_string(),
            seconds(task.end_ms),
            "-i".to_string(),
            source.to_string_lossy().into_owned(),
            "-map".to_string(),
            format!("0:{}", task.stream.stream_index),
        ];
        args.extend(self.extra_args.iter().cloned());

        let steps = task.kind.step_count();
        if let TaskKind::Video { .. } = task.kind {
            if steps > 1 {
                args.push("-pass".to_string());
                args.push(step.to_string());
                args.push("-passlogfile".to_string());
                args.push(task.task_id.to_string());
            }
        }

        if step < steps {
            // analysis passes only produce the pass log
            args.extend(["-f".to_string(), "null".to_string(), "-".to_string()]);
        } else {
            args.push(task.scratch_file_name());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobId;
    use crate::domain::task::fixtures::{audio_task, video_task};

    #[test]
    fn single_pass_writes_scratch_file() {
        let task = audio_task(JobId::generate(), 1).task;
        let args = FfmpegCommandBuilder::new("ffmpeg", "/shared").build(&task, 1);

        assert_eq!(args[0], "ffmpeg");
        assert!(args.contains(&"0:1".to_string()));
        assert!(!args.contains(&"-pass".to_string()));
        assert_eq!(args.last(), Some(&task.scratch_file_name()));
    }

    #[test]
    fn first_of_two_passes_discards_output() {
        let task = video_task(JobId::generate(), 1, 2).task;
        let builder = FfmpegCommandBuilder::new("ffmpeg", "/shared");

        let first = builder.build(&task, 1);
        assert!(first.windows(2).any(|w| w[0] == "-pass" && w[1] == "1"));
        assert_eq!(first.last().map(String::as_str), Some("-"));
        assert!(first.windows(2).any(|w| w[0] == "-ss" && w[1] == "60.000"));

        let second = builder.build(&task, 2);
        assert!(second.windows(2).any(|w| w[0] == "-pass" && w[1] == "2"));
        assert_eq!(second.last(), Some(&task.scratch_file_name()));
    }
}
