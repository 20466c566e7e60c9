//! Common infrastructure for the vxtun overlay tunnel daemon.
//!
//! This crate provides the pieces every vxtun component shares:
//!
//! - [`shell`]: Safe shell command execution with proper quoting, behind
//!   the [`CommandRunner`] trait
//! - [`host`]: Platform and privilege checks behind [`HostIdentity`]
//! - [`error`]: The [`TunnelError`] taxonomy
//!
//! # Example
//!
//! ```ignore
//! use vxtun_common::{
//!     shell::{IP_CMD, shellquote},
//!     CommandRunner, TunnelResult,
//! };
//!
//! async fn link_up(runner: &dyn CommandRunner, ifname: &str) -> TunnelResult<()> {
//!     let cmd = format!("{} link set dev {} up", IP_CMD, shellquote(ifname));
//!     runner.run_checked(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod host;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{TunnelError, TunnelResult};
pub use host::{ensure_linux, ensure_privileged_linux, HostIdentity, LocalHost};
pub use shell::{CommandRunner, ExecResult, ShellRunner};
