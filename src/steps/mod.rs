//! Shipped step implementations.
//!
//! These are the generic building blocks the planning modules assemble
//! their work from: run a command with a convergence guard, ensure a
//! directory tree, upload a file, render generated content to a host path.
//! Anything cluster-specific lives in the planning modules that parametrize
//! these steps, not here.

pub mod command;
pub mod ensure_dir;
pub mod render_file;
pub mod upload;

pub use command::CommandStep;
pub use ensure_dir::EnsureDirStep;
pub use render_file::RenderFileStep;
pub use upload::UploadStep;
