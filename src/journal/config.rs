//! 打开模式与可调参数

use crate::consts::{DEFAULT_ALIGNMENT_SIZE, DEFAULT_BLOCKS_PER_PAGE, DEFAULT_BLOCK_SIZE};

/// journal 的打开模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 只读：拒绝一切变更操作，映射保持只读
    ReadOnly,
    /// 读写
    ReadWrite,
}

/// 提交模式
///
/// 决定每个变更操作结束时是否同步等待落盘。公共 `commit()` 在两种
/// 模式下都强制同步刷出。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// 由 OS 决定写回时机；崩溃后可能丢失最近的变更
    Implicit,
    /// 每个变更操作同步刷出其触碰的页
    Explicit,
}

/// 保护模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionMode {
    /// 映射保持可写
    Unprotected,
    /// 变更调用之外映射保持只读，拦截杂散指针写坏 journal
    Protected,
}

/// 打开/创建 journal 的全部可调参数
///
/// 几何参数（`block_size`/`blocks_per_page`/`alignment_size`/
/// `user_data_size`）只在创建新文件时生效；附着既有文件时采用文件
/// 持久化的几何，忽略这里的值。三个上限为 -1 时表示不限制。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalConfig {
    pub commit_mode: CommitMode,
    pub protection_mode: ProtectionMode,
    /// 文件不存在时是否创建（false 时返回 `FileNotExists`）
    pub create_if_not_found: bool,
    /// 块大小（字节）
    pub block_size: u32,
    /// 每页块数
    pub blocks_per_page: u32,
    /// 对齐大小（字节，2 的幂，不小于系统页大小）
    pub alignment_size: u32,
    /// 用户数据区域大小（字节）
    pub user_data_size: u32,
    /// 确认后保留的最大记录数（-1 = 不限制，0 = 确认即淘汰）
    pub max_confirmed_records_kept: i64,
    /// 确认后保留的最大字节数（-1 = 不限制）
    pub max_confirmed_bytes_kept: i64,
    /// 文件大小上限（-1 = 不限制）
    pub max_file_size: i64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            commit_mode: CommitMode::Implicit,
            protection_mode: ProtectionMode::Unprotected,
            create_if_not_found: true,
            block_size: DEFAULT_BLOCK_SIZE,
            blocks_per_page: DEFAULT_BLOCKS_PER_PAGE,
            alignment_size: DEFAULT_ALIGNMENT_SIZE,
            user_data_size: 0,
            max_confirmed_records_kept: -1,
            max_confirmed_bytes_kept: -1,
            max_file_size: -1,
        }
    }
}
