#![doc = include_str!("../README.md")]

extern crate bitcoin;

pub mod collaborators;
pub mod error;
pub mod exchange;
pub mod handshake;
pub mod protocol;
pub mod utill;
