//! `CommandQuery` sample server: the widget domain served over HTTP through
//! tower dispatch layers.

pub mod domain;
pub mod network;
pub mod service;
