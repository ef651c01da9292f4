#![no_std]

pub mod channel;
pub mod net;
pub mod ports;
pub mod relay;
