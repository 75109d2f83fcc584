//! Remote session core of the WinAdmin console: named Windows hosts reached
//! over SSH, one operation fanned out to many of them, and resumable file
//! transfers.

pub mod remote;
