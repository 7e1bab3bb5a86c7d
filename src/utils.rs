//! Small helpers shared by the CLI and the gateway.

pub(crate) mod errors;
pub(crate) mod paths;
pub(crate) mod tempfile;
