// API 数据传输对象模块
// 包含所有与前端交互的通用数据结构

pub mod common;

pub use common::*;
