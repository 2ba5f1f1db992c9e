//! 常量定义

/// journal 文件 magic number（"PJRN"）
pub const JOURNAL_MAGIC: u32 = 0x504A_524E;

/// 当前磁盘格式版本
pub const FORMAT_VERSION: u32 = 1;

/// 无效块索引哨兵（链表终止符）
pub const NIL_BLOCK: u32 = u32::MAX;

/// 默认块大小（字节）
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// 默认每页块数
pub const DEFAULT_BLOCKS_PER_PAGE: u32 = 64;

/// 默认对齐大小（字节）
///
/// header 区域和每一页在文件内都按此对齐，保证 mmap 偏移合法。
pub const DEFAULT_ALIGNMENT_SIZE: u32 = 64 * 1024;

/// 最小对齐大小：必须覆盖所有平台的 OS 页大小
pub const MIN_ALIGNMENT_SIZE: u32 = 4096;

/// 固定 header 的编码长度（不含用户数据区域），见 `header` 模块
pub const JOURNAL_HEADER_SIZE: usize = 152;

/// 单个块头表项的编码长度，见 `types` 模块
pub const BLOCK_HEADER_SIZE: usize = 48;

/// 向上对齐到 `align`（要求 `align` 为 2 的幂）
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_alignment_is_power_of_two() {
        assert!(DEFAULT_ALIGNMENT_SIZE.is_power_of_two());
        assert!(MIN_ALIGNMENT_SIZE.is_power_of_two());
    }
}
