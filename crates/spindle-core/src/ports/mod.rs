//! Ports - 抽象化レイヤー
//!
//! Worker / Coordinator が外部（時刻、ID、プロセス、ファイルシステム）に
//! 触れる箇所はすべてここの trait を経由する。実装は `impls` に置く。

pub mod clock;
pub mod command;
pub mod executor;
pub mod id_generator;
pub mod output;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::command::CommandBuilder;
pub use self::executor::{CommandExecutor, ExecError, ProgressEvent, ProgressParser};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::output::OutputFinalizer;
