// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 检测核心错误类型
//!
//! 每一个单工具失败都落到下面某个分类里,流水线把它记在结果里而不是向上抛。

use thiserror::Error;

/// 核心错误
#[derive(Debug, Error)]
pub enum VisionError {
    /// 相机打不开或已断开
    #[error("相机不可用: {0}")]
    DeviceUnavailable(String),

    /// 配置被拒绝 (校验失败 / 不支持的像素格式或尺寸)
    #[error("配置被拒绝 {field}: {message}")]
    ConfigRejected { field: String, message: String },

    /// 推理工具没有可用模型
    #[error("模型未加载: {0}")]
    ModelNotLoaded(String),

    /// 模型调用过程中出错
    #[error("推理失败: {0}")]
    InferenceError(String),

    /// 上一次单拍尚未完成
    #[error("单拍进行中")]
    Busy,

    /// 距上一次单拍不足冷却时间
    #[error("单拍冷却中, 还需 {remaining_ms}ms")]
    Cooldown { remaining_ms: u64 },

    /// 请求判定但尚未设置参考
    #[error("no reference set")]
    ReferenceMissing,

    /// 作业结构不合法 (重复相机源、顺序错误等)
    #[error("作业无效: {0}")]
    InvalidJob(String),

    /// 找不到工具
    #[error("工具不存在: {0}")]
    ToolNotFound(u32),

    /// 当前状态下不允许该操作
    #[error("状态错误: {0}")]
    InvalidState(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 错误分类标签 (可比较, 便于测试和诊断面板)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    ConfigRejected,
    ModelNotLoaded,
    InferenceError,
    Busy,
    Cooldown,
    ReferenceMissing,
    InvalidJob,
    ToolNotFound,
    InvalidState,
    Io,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::DeviceUnavailable => "device_unavailable",
            ErrorKind::ConfigRejected => "config_rejected",
            ErrorKind::ModelNotLoaded => "model_not_loaded",
            ErrorKind::InferenceError => "inference_error",
            ErrorKind::Busy => "busy",
            ErrorKind::Cooldown => "cooldown",
            ErrorKind::ReferenceMissing => "reference_missing",
            ErrorKind::InvalidJob => "invalid_job",
            ErrorKind::ToolNotFound => "tool_not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VisionError {
    pub fn rejected(field: impl Into<String>, message: impl Into<String>) -> Self {
        VisionError::ConfigRejected {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VisionError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            VisionError::ConfigRejected { .. } => ErrorKind::ConfigRejected,
            VisionError::ModelNotLoaded(_) => ErrorKind::ModelNotLoaded,
            VisionError::InferenceError(_) => ErrorKind::InferenceError,
            VisionError::Busy => ErrorKind::Busy,
            VisionError::Cooldown { .. } => ErrorKind::Cooldown,
            VisionError::ReferenceMissing => ErrorKind::ReferenceMissing,
            VisionError::InvalidJob(_) => ErrorKind::InvalidJob,
            VisionError::ToolNotFound(_) => ErrorKind::ToolNotFound,
            VisionError::InvalidState(_) => ErrorKind::InvalidState,
            VisionError::Io(_) => ErrorKind::Io,
            VisionError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// 像素格式被拒绝时 field 固定为 "pixel_format"
    pub fn is_pixel_format_rejection(&self) -> bool {
        matches!(self, VisionError::ConfigRejected { field, .. } if field == "pixel_format")
    }

    /// 启动阶段的进程退出码
    ///
    /// 缺相机 = 2, 缺模型文件 = 3, 配置无效 = 4, 像素格式不支持 = 5
    pub fn exit_code(&self) -> i32 {
        if self.is_pixel_format_rejection() {
            return 5;
        }
        match self.kind() {
            ErrorKind::DeviceUnavailable => 2,
            ErrorKind::ModelNotLoaded => 3,
            ErrorKind::ConfigRejected | ErrorKind::InvalidJob | ErrorKind::Serialization => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, VisionError>;
