//! Wire codecs shared by the uplink and downlink pipelines (spec §4.A/§4.B).

pub mod gwmp;
pub mod radio;
