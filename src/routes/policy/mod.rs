// 治理策略配置路由
// 读写均为整对象：GET 返回当前快照，POST 校验后整体替换

pub mod handler;
pub mod model;

pub use handler::*;
