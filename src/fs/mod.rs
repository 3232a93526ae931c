//! Filesystem operation layer (spec.md §4.I): fids, the control file, the
//! directory-read buffer, and the request handlers that tie them to a
//! `Tree`. Wire framing and dispatch belong to an external caller; this
//! module only exposes the operations that caller drives.

mod control;
mod dirbuf;
mod fid;
mod ops;

pub use control::ControlFile;
pub use fid::{Aux, Fid, FidState, FidTable};
pub use ops::Filesystem;
