//! Local IP guessing and port-owner lookup used at startup for bind
//! addresses and "port already in use" diagnostics.

mod ip_utils;
mod process;

pub use ip_utils::{guess_local_ip, list_all_ips};
pub use process::{find_process_using_port, ProcessPortInfo, TransportProtocol};