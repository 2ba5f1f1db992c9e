//! 错误类型定义
//!
//! 提供持久化 journal 操作的错误类型。
//!
//! 所有公共操作都返回 [`Result`]；内部不使用 panic 作为控制流。
//! [`ErrorKind::Internal`] 表示分配器/链表不变量被破坏，属于 bug 级别的
//! 状态，调试构建中会同时触发 `debug_assert!`。

use core::fmt;

/// journal 操作错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: &'static str,
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// I/O 错误
    Io,
    /// 内存映射建立失败
    Mem,
    /// 文件不是有效的 journal（magic/几何/校验和不匹配）
    InvalidFile,
    /// 内部不变量被破坏（bug，不可恢复）
    Internal,
    /// journal 生命周期状态错误（未打开、已关闭或只读）
    BadState,
    /// 分配超出配置上限
    Full,
    /// 未找到
    NotFound,
    /// 磁盘格式版本不受支持
    UnsupportedVersion,
    /// 句柄没有对应到期望链表中的活动记录
    InvalidRecordHandle,
    /// 文件不存在（且未要求创建）
    FileNotExists,
    /// 文件创建失败
    FileCreationFailed,
    /// 页保护切换失败
    ProtectionFailure,
    /// maxFileSize 配置无效
    InvalidMaxFileSize,
    /// 记录超过空 journal 能容纳的最大尺寸
    MaxRecordSizeForEmptyJournalViolation,
    /// 记录超过 maxFileSize 推导出的最大尺寸
    MaxRecordSizeViolation,
    /// 解除映射失败
    UnmapFailure,
    /// msync 刷盘失败
    SyncFailure,
}

impl Error {
    /// 创建新错误
    pub const fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self { kind, message }
    }

    /// 创建带原因的错误（cause 仅记入日志）
    pub fn with_cause(kind: ErrorKind, message: &'static str, cause: impl fmt::Debug) -> Self {
        log::debug!("{:?}: {} (cause: {:?})", kind, message, cause);
        Self { kind, message }
    }

    /// 获取错误类型
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取错误消息
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

/// Result 类型别名
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_accessors() {
        let e = Error::new(ErrorKind::Full, "journal is full");
        assert_eq!(e.kind(), ErrorKind::Full);
        assert_eq!(e.message(), "journal is full");
    }

    #[test]
    fn test_error_display() {
        let e = Error::new(ErrorKind::InvalidRecordHandle, "stale handle");
        assert_eq!(format!("{}", e), "InvalidRecordHandle: stale handle");
    }
}
