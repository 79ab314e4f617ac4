// 成本统计、预测与导出路由

pub mod handler;
pub mod model;

pub use handler::*;
