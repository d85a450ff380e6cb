#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod app; // 应用上下文 (组件装配 / 线程 / 退出)
pub mod camera; // 相机帧源与单拍
pub mod config; // 应用配置参数
pub mod detection; // 检测/分类结果类型
pub mod error; // 错误类型
pub mod frame; // 帧
pub mod job; // 作业 (工具列表与持久化)
pub mod models; // 推理后端接口与前后处理
pub mod pipeline; // 执行器 / 帧存储 / 工作流
pub mod result; // OK/NG 判定
pub mod review; // 回看环
pub mod settings; // 设置页与界面回调
pub mod tools; // 工具
pub mod view; // 显示协调

pub use crate::app::{AppContext, ReviewPane, RunReport};
pub use crate::camera::{CameraMode, CameraSettings, FrameSource, PixelFormat, SourceState, StubCamera};
pub use crate::config::AppConfig;
pub use crate::detection::{BoundingBox, Classification, Detection};
pub use crate::error::{ErrorKind, Result, VisionError};
pub use crate::frame::{Frame, PixelLayout, Rotation};
pub use crate::job::{JobDocument, JobManager};
pub use crate::pipeline::{PipelineContext, PipelineExecutor, PipelineRun};
pub use crate::result::{ResultManager, Status, Verdict};
pub use crate::review::{ReviewListener, ReviewRing, ReviewSnapshot};
pub use crate::settings::{SettingsCoordinator, UiHost};
pub use crate::tools::{ToolKind, ToolRegistry};
pub use crate::view::{DisplayMode, ViewCoordinator};

/// 本地时间戳字符串, 用于保存截图和作业文件名
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    chrono::Local::now().format(&fmt).to_string()
}
