pub(crate) mod ota;

pub(crate) use ota::{EspRestart, OtaService};
