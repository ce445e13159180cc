//! deej - physical sliders to live audio volume
//!
//! Reads slider positions from a serial device, maps each slider to one or
//! more audio targets (applications, devices, master/mic, the foreground
//! window, or everything not otherwise mapped) and applies the volume.
//!
//! Pipeline: [`serial`] decodes lines into [`serial::SliderMoveEvent`]s,
//! [`router`] fans them into the [`session::SessionRegistry`], which resolves
//! targets from the [`config::SliderMapping`] and drives the platform
//! [`session::SessionFinder`].

pub mod config;
pub mod router;
pub mod serial;
pub mod session;
