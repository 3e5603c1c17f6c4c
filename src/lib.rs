//! mailrelay - store-and-forward e-mail relay
//!
//! This library provides the mailbox store, the framed wire protocol and the
//! server and client sessions behind the `mailrelay` binary.

pub mod mailserver;
