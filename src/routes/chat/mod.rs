// 受治理的聊天入口

pub mod handler;
pub mod model;

pub use handler::*;
