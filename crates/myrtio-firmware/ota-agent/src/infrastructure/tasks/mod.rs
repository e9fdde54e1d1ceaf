pub(crate) mod blink;
pub(crate) mod network;
pub(crate) mod ota;

pub(crate) use blink::blink_task;
pub(crate) use network::{network_runner_task, wifi_connection_task};
pub(crate) use ota::ota_task;
