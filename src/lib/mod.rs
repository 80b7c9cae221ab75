// Core library utilities for the kernel

pub mod arena;
pub mod error;
pub mod printk;
pub mod ringbuf;
pub mod debug;
pub mod panic;
pub mod bootlog;
pub mod init_error;
