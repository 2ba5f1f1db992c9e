//! journal 对外门面
//!
//! [`PersistentJournal`] 把内部核心包在一把读写锁里：读操作
//! （访问器、迭代器）共享读锁，变更操作独占写锁并经由
//! `with_write_txn` 走固定序列
//! 解保护 → 开始事务 → 变更 → 提交/中止 → 重保护。
//! 变更失败时内存状态精确回滚，journal 保持可用。
//!
//! # 崩溃容忍
//!
//! 磁盘上的权威状态是文件头：每次事务提交把头写回映射。进程在
//! 变更中途崩溃时，文件头仍是上一次提交的快照，半写的块要么还在
//! 空闲链表里要么在尚未登记的新增页里，重新打开后被正常复用。
//! EXPLICIT_COMMIT 模式下每个变更操作同步落盘；IMPLICIT_COMMIT
//! 模式交给 OS 写回，崩溃可能回退最近的若干操作但不破坏结构。

pub mod config;
pub(crate) mod core;
mod iterator;

use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;

use log::{debug, info};
use parking_lot::RwLock;

use crate::consts::{JOURNAL_HEADER_SIZE, MIN_ALIGNMENT_SIZE, NIL_BLOCK};
use crate::error::{Error, ErrorKind, Result};
use crate::header::{JournalHeader, StateHeader};
use crate::list::RecordList;
use crate::mapping::{Geometry, PageMapping};
use crate::types::{BlockHeader, BlockOwner, RecordHandle};

use self::core::JournalCore;
pub use self::config::{CommitMode, JournalConfig, Mode, ProtectionMode};
pub use self::iterator::RecordIterator;

/// 锁之内的 journal 状态
pub(crate) enum JournalState {
    Open(Box<JournalCore>),
    Closed,
}

/// 线程安全、崩溃容忍的文件背书记录 journal
///
/// 记录先以未确认状态进入，处理完毕后确认；已确认记录按确认顺序
/// 保留，受保留上限约束从最旧端淘汰。所有方法都取 `&self`，实例
/// 可直接跨线程共享。
pub struct PersistentJournal {
    state: RwLock<JournalState>,
}

impl std::fmt::Debug for PersistentJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 映射句柄没有有意义的 Debug 输出，只报告生命周期状态
        let state = match self.state.try_read() {
            Some(guard) => match &*guard {
                JournalState::Open(_) => "open",
                JournalState::Closed => "closed",
            },
            None => "locked",
        };
        f.debug_struct("PersistentJournal")
            .field("state", &state)
            .finish()
    }
}

impl PersistentJournal {
    /// 打开（或按需创建）journal 文件
    ///
    /// 文件不存在时：READ_ONLY 模式或 `create_if_not_found = false`
    /// 返回 `FileNotExists`，否则按 `config` 的几何参数创建新文件。
    /// 文件存在时附着之：采用文件里持久化的几何与保留上限，忽略
    /// `config` 中对应的字段（`commit_mode`/`protection_mode` 是
    /// 运行期旋钮，始终取自 `config`）。
    pub fn open(path: impl AsRef<Path>, mode: Mode, config: JournalConfig) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let file = OpenOptions::new()
                .read(true)
                .write(mode == Mode::ReadWrite)
                .open(path)
                .map_err(|e| {
                    Error::with_cause(ErrorKind::Io, "failed to open journal file", e)
                })?;
            Self::attach(file, mode, config)
        } else {
            if mode == Mode::ReadOnly || !config.create_if_not_found {
                return Err(Error::new(
                    ErrorKind::FileNotExists,
                    "journal file does not exist",
                ));
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    Error::with_cause(
                        ErrorKind::FileCreationFailed,
                        "failed to create journal file",
                        e,
                    )
                })?;
            Self::create(file, config)
        }
    }

    /// 附着到一个已打开的 journal 文件句柄
    ///
    /// 与 [`PersistentJournal::open`] 的附着路径等价：采用文件里
    /// 持久化的几何与保留上限。`file` 必须可读，READ_WRITE 模式下
    /// 还必须可写；内容不是有效 journal 时返回 `InvalidFile`。
    pub fn from_file(file: std::fs::File, mode: Mode, config: JournalConfig) -> Result<Self> {
        Self::attach(file, mode, config)
    }

    /// 在一个全新的空文件上初始化 journal
    fn create(file: std::fs::File, config: JournalConfig) -> Result<Self> {
        if config.block_size == 0 || config.blocks_per_page == 0 {
            return Err(Error::new(ErrorKind::BadState, "invalid journal geometry"));
        }
        if config.alignment_size < MIN_ALIGNMENT_SIZE
            || !config.alignment_size.is_power_of_two()
        {
            return Err(Error::new(ErrorKind::BadState, "invalid alignment size"));
        }
        let geometry = Geometry {
            block_size: config.block_size,
            blocks_per_page: config.blocks_per_page,
            alignment_size: config.alignment_size,
            user_data_size: config.user_data_size,
        };
        // 上限必须至少容纳一页，否则 journal 永远放不下任何记录
        if config.max_file_size >= 0 && geometry.pages_within(config.max_file_size as u64) == 0 {
            return Err(Error::new(
                ErrorKind::InvalidMaxFileSize,
                "max file size cannot hold a single page",
            ));
        }

        let header = JournalHeader {
            block_size: config.block_size,
            blocks_per_page: config.blocks_per_page,
            alignment_size: config.alignment_size,
            user_data_size: config.user_data_size,
            creation_micros: JournalCore::now_micros(),
            max_confirmed_records_kept: config.max_confirmed_records_kept,
            max_confirmed_bytes_kept: config.max_confirmed_bytes_kept,
            max_file_size: config.max_file_size,
            state: StateHeader::empty(),
        };
        file.set_len(geometry.header_region_size()).map_err(|e| {
            Error::with_cause(ErrorKind::Io, "failed to size journal file", e)
        })?;
        let header_map = PageMapping::map(&file, 0, geometry.header_region_size(), false)?;
        let mut core = JournalCore {
            file,
            mode: Mode::ReadWrite,
            commit_mode: config.commit_mode,
            protection_mode: config.protection_mode,
            geometry,
            header,
            header_map,
            pages: Vec::new(),
            txn: None,
        };
        core.write_header_to_mapping()?;
        if config.commit_mode == CommitMode::Explicit {
            core.flush_all()?;
        }
        core.protect_all()?;
        info!(
            "[JOURNAL] created: block_size={} blocks_per_page={} alignment={}",
            config.block_size, config.blocks_per_page, config.alignment_size
        );
        Ok(Self {
            state: RwLock::new(JournalState::Open(Box::new(core))),
        })
    }

    /// 附着到一个既有的 journal 文件
    fn attach(file: std::fs::File, mode: Mode, config: JournalConfig) -> Result<Self> {
        let mut buf = [0u8; JOURNAL_HEADER_SIZE];
        (&file).read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::new(ErrorKind::InvalidFile, "file too short for journal header")
            } else {
                Error::with_cause(ErrorKind::Io, "failed to read journal header", e)
            }
        })?;
        let header = JournalHeader::decode(&buf)?;
        if header.block_size == 0
            || header.blocks_per_page == 0
            || !header.alignment_size.is_power_of_two()
        {
            return Err(Error::new(ErrorKind::InvalidFile, "corrupted geometry"));
        }
        let geometry = Geometry {
            block_size: header.block_size,
            blocks_per_page: header.blocks_per_page,
            alignment_size: header.alignment_size,
            user_data_size: header.user_data_size,
        };
        let actual_len = file
            .metadata()
            .map_err(|e| Error::with_cause(ErrorKind::Io, "failed to stat journal file", e))?
            .len();
        if actual_len < geometry.file_size_for_pages(header.state.num_pages) {
            return Err(Error::new(ErrorKind::InvalidFile, "truncated journal file"));
        }

        // 只读模式下映射必须只读；受保护模式下初始即保持只读
        let protected =
            mode == Mode::ReadOnly || config.protection_mode == ProtectionMode::Protected;
        let header_map = PageMapping::map(&file, 0, geometry.header_region_size(), protected)?;
        let mut pages = Vec::with_capacity(header.state.num_pages as usize);
        for page in 0..header.state.num_pages {
            pages.push(PageMapping::map(
                &file,
                geometry.page_offset(page),
                geometry.page_size(),
                protected,
            )?);
        }
        info!(
            "[JOURNAL] attached: {} pages, {} confirmed, {} unconfirmed records",
            header.state.num_pages, header.state.confirmed_records, header.state.unconfirmed_records
        );
        Ok(Self {
            state: RwLock::new(JournalState::Open(Box::new(JournalCore {
                file,
                mode,
                commit_mode: config.commit_mode,
                protection_mode: config.protection_mode,
                geometry,
                header,
                header_map,
                pages,
                txn: None,
            }))),
        })
    }

    /// 读路径：在读锁下访问核心
    fn with_core<T>(&self, f: impl FnOnce(&JournalCore) -> Result<T>) -> Result<T> {
        match &*self.state.read() {
            JournalState::Open(core) => f(core),
            JournalState::Closed => Err(Error::new(ErrorKind::BadState, "journal is closed")),
        }
    }

    /// 变更路径：写锁 + 解保护 + 事务 + 重保护的固定序列
    ///
    /// `f` 返回错误时事务中止、内存状态回滚；提交本身失败
    /// （`SyncFailure`）时**不**回滚，状态保持为已应用。
    fn with_write_txn<T>(&self, f: impl FnOnce(&mut JournalCore) -> Result<T>) -> Result<T> {
        let mut guard = self.state.write();
        let core = match &mut *guard {
            JournalState::Open(core) => core,
            JournalState::Closed => {
                return Err(Error::new(ErrorKind::BadState, "journal is closed"))
            }
        };
        if core.mode != Mode::ReadWrite {
            return Err(Error::new(
                ErrorKind::BadState,
                "journal opened read-only",
            ));
        }
        if let Err(e) = core.unprotect_all() {
            // 部分页可能已翻转为可写，离开前恢复保护
            if let Err(pe) = core.protect_all() {
                log::error!(
                    "[JOURNAL] failed to re-protect after partial unprotect: {}",
                    pe
                );
            }
            return Err(e);
        }
        core.begin_transaction();
        let result = match f(core) {
            Ok(v) => core.commit_transaction(false).map(|_| v),
            Err(e) => {
                core.abort_transaction();
                Err(e)
            }
        };
        match core.protect_all() {
            Ok(()) => result,
            // 重保护失败时保留首因错误
            Err(e) => result.and(Err(e)),
        }
    }

    /// 追加一条新记录到未确认链表尾部，返回其句柄
    ///
    /// 记录立即可经迭代器读取。IMPLICIT_COMMIT 模式下落盘时机由 OS
    /// 决定；EXPLICIT_COMMIT 模式下返回前同步落盘。
    pub fn add_record(&self, data: &[u8]) -> Result<RecordHandle> {
        self.add_record_vectored(&[data])
    }

    /// `add_record` 的分散缓冲版本：`slices` 逻辑上连续拼成一条记录
    pub fn add_record_vectored(&self, slices: &[&[u8]]) -> Result<RecordHandle> {
        let total: u64 = slices.iter().map(|s| s.len() as u64).sum();
        debug_assert!(total > 0, "empty record");
        self.with_write_txn(|core| {
            if total > u32::MAX as u64 {
                return Err(Error::new(
                    ErrorKind::MaxRecordSizeViolation,
                    "record exceeds representable length",
                ));
            }
            let block_size = core.geometry.block_size as u64;
            if let Some(limit) = core.header.file_size_limit() {
                let capacity_blocks =
                    core.geometry.pages_within(limit) as u64 * core.geometry.blocks_per_page as u64;
                if total > capacity_blocks * block_size {
                    return Err(Error::new(
                        ErrorKind::MaxRecordSizeForEmptyJournalViolation,
                        "record cannot fit even in an empty journal",
                    ));
                }
                let used =
                    core.header.state.confirmed_blocks + core.header.state.unconfirmed_blocks;
                if total > (capacity_blocks - used) * block_size {
                    return Err(Error::new(
                        ErrorKind::MaxRecordSizeViolation,
                        "record does not fit in remaining capacity",
                    ));
                }
            }

            let num_blocks = ((total + block_size - 1) / block_size) as u32;
            let alloc = core.allocate_blocks(num_blocks)?;
            core.write_record_data(&alloc.blocks, slices)?;

            let head = alloc.blocks[0];
            let mut hdr = BlockHeader {
                next_block: alloc.blocks.get(1).copied().unwrap_or(NIL_BLOCK),
                prev_record: NIL_BLOCK,
                next_record: NIL_BLOCK,
                tail_block: *alloc.blocks.last().unwrap_or(&head),
                length: total as u32,
                num_blocks,
                creation_micros: JournalCore::now_micros(),
                confirmation_micros: 0,
                owner: BlockOwner::Unconfirmed,
            };
            core.push_back_record(RecordList::Unconfirmed, head, &mut hdr)?;
            let s = &mut core.header.state;
            if s.highest_block_used == NIL_BLOCK || alloc.highest > s.highest_block_used {
                s.highest_block_used = alloc.highest;
            }
            Ok(head)
        })
    }

    /// 把未确认记录移入已确认链表尾部并打确认时间戳
    ///
    /// 确认后按保留上限从已确认链表头部（最旧端）淘汰，上限为 0
    /// 表示确认即淘汰。句柄不指向未确认记录时返回
    /// `InvalidRecordHandle`。
    pub fn confirm_record(&self, handle: RecordHandle) -> Result<()> {
        self.with_write_txn(|core| {
            let mut hdr = core.check_live_record(handle, Some(BlockOwner::Unconfirmed))?;
            core.unlink_record(RecordList::Unconfirmed, &hdr)?;
            hdr.owner = BlockOwner::Confirmed;
            hdr.confirmation_micros = JournalCore::now_micros();
            core.push_back_record(RecordList::Confirmed, handle, &mut hdr)?;
            core.evict_confirmed()?;
            Ok(())
        })
    }

    /// 释放一条记录（未确认或已确认均可），块链回到空闲链表
    ///
    /// 释放后句柄随即可能被新记录复用；继续持有旧句柄属于调用方
    /// 契约违约。
    pub fn remove_record(&self, handle: RecordHandle) -> Result<()> {
        self.with_write_txn(|core| {
            let hdr = core.check_live_record(handle, None)?;
            let list = match hdr.owner {
                BlockOwner::Unconfirmed => RecordList::Unconfirmed,
                _ => RecordList::Confirmed,
            };
            core.unlink_record(list, &hdr)?;
            core.free_record_blocks(handle, &hdr)?;
            Ok(())
        })
    }

    /// 同步把全部内存状态刷入磁盘（两种提交模式下都强制等待）
    pub fn commit(&self) -> Result<()> {
        let mut guard = self.state.write();
        match &mut *guard {
            JournalState::Open(core) => {
                if core.mode != Mode::ReadWrite {
                    return Ok(());
                }
                core.flush_all()
            }
            JournalState::Closed => Err(Error::new(ErrorKind::BadState, "journal is closed")),
        }
    }

    /// 关闭 journal：尽力刷盘后释放文件与映射
    ///
    /// 幂等；关闭后除 `close` 外的任何操作返回 `BadState`。
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.write();
        if let JournalState::Open(core) = &mut *guard {
            if core.mode == Mode::ReadWrite {
                core.flush_all()?;
            }
            info!("[JOURNAL] closed");
        }
        *guard = JournalState::Closed;
        Ok(())
    }

    /// 切换保护模式（只读打开的 journal 只记录模式不翻转映射）
    pub fn set_protection_mode(&self, mode: ProtectionMode) -> Result<()> {
        let mut guard = self.state.write();
        let core = match &mut *guard {
            JournalState::Open(core) => core,
            JournalState::Closed => {
                return Err(Error::new(ErrorKind::BadState, "journal is closed"))
            }
        };
        core.protection_mode = mode;
        if core.mode == Mode::ReadWrite {
            match mode {
                ProtectionMode::Protected => core.protect_all()?,
                ProtectionMode::Unprotected => core.unprotect_all()?,
            }
        }
        Ok(())
    }

    /// 调整文件大小上限
    ///
    /// 新上限必须仍能容纳当前已映射的页（且至少一页），否则返回
    /// `InvalidMaxFileSize`；-1 解除限制。
    pub fn set_max_file_size(&self, max_file_size: i64) -> Result<()> {
        self.with_write_txn(|core| {
            if max_file_size >= 0 {
                let pages = core.geometry.pages_within(max_file_size as u64);
                if pages == 0 || pages < core.header.state.num_pages {
                    return Err(Error::new(
                        ErrorKind::InvalidMaxFileSize,
                        "max file size below current journal size",
                    ));
                }
            }
            core.header.max_file_size = max_file_size;
            Ok(())
        })
    }

    /// 覆写用户数据区域前缀（区域大小创建时固定）
    pub fn write_user_data(&self, data: &[u8]) -> Result<()> {
        self.with_write_txn(|core| core.write_user_data(data))
    }

    /// 读取整个用户数据区域
    pub fn user_data(&self) -> Result<Vec<u8>> {
        self.with_core(|core| core.user_data())
    }

    /// 迭代器：已确认链表最旧端
    pub fn first_confirmed_record(&self) -> RecordIterator<'_> {
        RecordIterator::new(self.state.read(), RecordList::Confirmed, false)
    }

    /// 迭代器：已确认链表最新端
    pub fn last_confirmed_record(&self) -> RecordIterator<'_> {
        RecordIterator::new(self.state.read(), RecordList::Confirmed, true)
    }

    /// 迭代器：未确认链表最旧端
    pub fn first_unconfirmed_record(&self) -> RecordIterator<'_> {
        RecordIterator::new(self.state.read(), RecordList::Unconfirmed, false)
    }

    /// 迭代器：未确认链表最新端
    pub fn last_unconfirmed_record(&self) -> RecordIterator<'_> {
        RecordIterator::new(self.state.read(), RecordList::Unconfirmed, true)
    }

    /// 读取一条记录的数据（持读锁期间拷贝出来）
    pub fn record_data(&self, handle: RecordHandle) -> Result<Vec<u8>> {
        self.with_core(|core| {
            core.check_live_record(handle, None)?;
            core.read_record_data(handle)
        })
    }

    /// 记录的字节长度
    pub fn record_length(&self, handle: RecordHandle) -> Result<u32> {
        self.with_core(|core| Ok(core.check_live_record(handle, None)?.length))
    }

    // ------------------------------------------------------------------
    // 访问器
    // ------------------------------------------------------------------

    pub fn mode(&self) -> Result<Mode> {
        self.with_core(|core| Ok(core.mode))
    }

    pub fn commit_mode(&self) -> Result<CommitMode> {
        self.with_core(|core| Ok(core.commit_mode))
    }

    pub fn protection_mode(&self) -> Result<ProtectionMode> {
        self.with_core(|core| Ok(core.protection_mode))
    }

    pub fn block_size(&self) -> Result<u32> {
        self.with_core(|core| Ok(core.header.block_size))
    }

    pub fn blocks_per_page(&self) -> Result<u32> {
        self.with_core(|core| Ok(core.header.blocks_per_page))
    }

    pub fn alignment_size(&self) -> Result<u32> {
        self.with_core(|core| Ok(core.header.alignment_size))
    }

    pub fn user_data_size(&self) -> Result<u32> {
        self.with_core(|core| Ok(core.header.user_data_size))
    }

    /// journal 创建时间（UTC）
    pub fn creation_time(&self) -> Result<std::time::SystemTime> {
        self.with_core(|core| {
            Ok(std::time::UNIX_EPOCH
                + std::time::Duration::from_micros(core.header.creation_micros))
        })
    }

    pub fn num_confirmed_records(&self) -> Result<u64> {
        self.with_core(|core| Ok(core.header.state.confirmed_records))
    }

    pub fn num_unconfirmed_records(&self) -> Result<u64> {
        self.with_core(|core| Ok(core.header.state.unconfirmed_records))
    }

    pub fn num_records(&self) -> Result<u64> {
        self.with_core(|core| {
            Ok(core.header.state.confirmed_records + core.header.state.unconfirmed_records)
        })
    }

    pub fn num_pages(&self) -> Result<u32> {
        self.with_core(|core| Ok(core.header.state.num_pages))
    }

    /// 历史最高已用块索引；从未分配过时为 `None`
    pub fn highest_block_used(&self) -> Result<Option<u32>> {
        self.with_core(|core| {
            let h = core.header.state.highest_block_used;
            Ok((h != NIL_BLOCK).then_some(h))
        })
    }

    pub fn max_confirmed_records_kept(&self) -> Result<i64> {
        self.with_core(|core| Ok(core.header.max_confirmed_records_kept))
    }

    pub fn max_confirmed_bytes_kept(&self) -> Result<i64> {
        self.with_core(|core| Ok(core.header.max_confirmed_bytes_kept))
    }

    pub fn max_file_size(&self) -> Result<i64> {
        self.with_core(|core| Ok(core.header.max_file_size))
    }

    /// 当前还能写入的最大单条记录字节数（-1 = 不限制）
    pub fn max_record_size(&self) -> Result<i64> {
        self.with_core(|core| {
            let Some(limit) = core.header.file_size_limit() else {
                return Ok(-1);
            };
            let capacity =
                core.geometry.pages_within(limit) as u64 * core.geometry.blocks_per_page as u64;
            let used = core.header.state.confirmed_blocks + core.header.state.unconfirmed_blocks;
            Ok(((capacity - used) * core.geometry.block_size as u64) as i64)
        })
    }

    /// 空 journal 能容纳的最大单条记录字节数（-1 = 不限制）
    pub fn max_record_size_for_empty_journal(&self) -> Result<i64> {
        self.with_core(|core| {
            let Some(limit) = core.header.file_size_limit() else {
                return Ok(-1);
            };
            let capacity =
                core.geometry.pages_within(limit) as u64 * core.geometry.blocks_per_page as u64;
            Ok((capacity * core.geometry.block_size as u64) as i64)
        })
    }

    /// 按链序收集空闲块索引（调试/测试用）
    pub fn free_block_indices(&self) -> Result<Vec<u32>> {
        self.with_core(|core| core.free_block_indices())
    }

    /// 把文件头内容以可读形式写入 `w`（调试用）
    pub fn print_header(&self, w: &mut dyn std::io::Write) -> Result<()> {
        self.with_core(|core| {
            let h = &core.header;
            let s = &h.state;
            writeln!(
                w,
                "journal header:\n  geometry: block_size={} blocks_per_page={} alignment={} user_data={}\n  limits: records_kept={} bytes_kept={} file_size={}\n  pages={} highest_block_used={}\n  confirmed: records={} blocks={} bytes={} head={} tail={}\n  unconfirmed: records={} blocks={} bytes={} head={} tail={}\n  free: blocks={} head={}",
                h.block_size, h.blocks_per_page, h.alignment_size, h.user_data_size,
                h.max_confirmed_records_kept, h.max_confirmed_bytes_kept, h.max_file_size,
                s.num_pages, s.highest_block_used as i32,
                s.confirmed_records, s.confirmed_blocks, s.confirmed_bytes,
                s.confirmed_head as i32, s.confirmed_tail as i32,
                s.unconfirmed_records, s.unconfirmed_blocks, s.unconfirmed_bytes,
                s.unconfirmed_head as i32, s.unconfirmed_tail as i32,
                s.free_blocks, s.free_head as i32,
            )
            .map_err(|e| Error::with_cause(ErrorKind::Io, "failed to write header dump", e))
        })
    }

    /// 底层文件描述符
    #[cfg(unix)]
    pub fn raw_fd(&self) -> Result<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.with_core(|core| Ok(core.file.as_raw_fd()))
    }
}

impl Drop for PersistentJournal {
    fn drop(&mut self) {
        if let JournalState::Open(core) = self.state.get_mut() {
            if core.mode == Mode::ReadWrite {
                if let Err(e) = core.flush_all() {
                    log::warn!("[JOURNAL] flush on drop failed: {}", e);
                }
            }
        }
    }
}

impl JournalCore {
    /// 按保留上限从已确认链表最旧端淘汰
    fn evict_confirmed(&mut self) -> Result<u64> {
        let mut evicted = 0u64;
        loop {
            let s = &self.header.state;
            let over_records = self
                .header
                .records_kept_limit()
                .map_or(false, |l| s.confirmed_records > l);
            let over_bytes = self
                .header
                .bytes_kept_limit()
                .map_or(false, |l| s.confirmed_bytes > l);
            if !over_records && !over_bytes {
                break;
            }
            let head = s.confirmed_head;
            if head == NIL_BLOCK {
                break;
            }
            let hdr = self.read_block_header(head)?;
            self.unlink_record(RecordList::Confirmed, &hdr)?;
            self.free_record_blocks(head, &hdr)?;
            evicted += 1;
        }
        if evicted > 0 {
            debug!("[JOURNAL] evicted {} confirmed records", evicted);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Duration;

    fn small_config() -> JournalConfig {
        JournalConfig {
            block_size: 32,
            blocks_per_page: 4,
            alignment_size: 4096,
            ..JournalConfig::default()
        }
    }

    fn journal_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("test.journal")
    }

    fn open_rw(path: &Path, config: JournalConfig) -> PersistentJournal {
        PersistentJournal::open(path, Mode::ReadWrite, config).unwrap()
    }

    #[test]
    fn test_create_and_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        assert_eq!(j.block_size().unwrap(), 32);
        assert_eq!(j.blocks_per_page().unwrap(), 4);
        assert_eq!(j.alignment_size().unwrap(), 4096);
        assert_eq!(j.num_records().unwrap(), 0);
        assert_eq!(j.num_pages().unwrap(), 0);
        assert_eq!(j.highest_block_used().unwrap(), None);
        assert_eq!(j.max_record_size().unwrap(), -1);
        assert_eq!(j.mode().unwrap(), Mode::ReadWrite);
    }

    #[test]
    fn test_missing_file_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            create_if_not_found: false,
            ..small_config()
        };
        let err = PersistentJournal::open(journal_path(&dir), Mode::ReadWrite, cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotExists);
        let err =
            PersistentJournal::open(journal_path(&dir), Mode::ReadOnly, small_config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileNotExists);
    }

    #[test]
    fn test_add_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        let payload: Vec<u8> = (0..100u16).map(|i| (i * 7) as u8).collect();
        let h = j.add_record(&payload).unwrap();
        assert_eq!(j.num_unconfirmed_records().unwrap(), 1);
        assert_eq!(j.record_length(h).unwrap(), 100);
        assert_eq!(j.record_data(h).unwrap(), payload);

        let it = j.first_unconfirmed_record();
        assert!(it.is_valid());
        assert_eq!(it.handle(), Some(h));
        assert_eq!(it.data().unwrap(), payload);
        assert!(!it.is_confirmed().unwrap());
        assert!(it.confirmation_time().is_err());
    }

    #[test]
    fn test_vectored_write_matches_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        let a = vec![1u8; 20];
        let b = vec![2u8; 45];
        let c = vec![3u8; 3];
        let h = j.add_record_vectored(&[&a, &b, &c]).unwrap();
        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        expected.extend_from_slice(&c);
        assert_eq!(j.record_data(h).unwrap(), expected);
    }

    #[test]
    fn test_confirm_moves_between_lists() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        let h1 = j.add_record(b"first").unwrap();
        let h2 = j.add_record(b"second").unwrap();
        assert_eq!(j.num_unconfirmed_records().unwrap(), 2);

        j.confirm_record(h1).unwrap();
        assert_eq!(j.num_unconfirmed_records().unwrap(), 1);
        assert_eq!(j.num_confirmed_records().unwrap(), 1);

        let it = j.first_confirmed_record();
        assert_eq!(it.handle(), Some(h1));
        assert!(it.is_confirmed().unwrap());
        assert!(it.confirmation_time().is_ok());
        drop(it);

        let it = j.first_unconfirmed_record();
        assert_eq!(it.handle(), Some(h2));
    }

    #[test]
    fn test_confirm_rejects_stale_handle() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        let h = j.add_record(b"x").unwrap();
        j.confirm_record(h).unwrap();
        // 已确认的记录不能再次确认
        assert_eq!(
            j.confirm_record(h).unwrap_err().kind(),
            ErrorKind::InvalidRecordHandle
        );
        j.remove_record(h).unwrap();
        // 已释放的记录两种操作都拒绝
        assert_eq!(
            j.confirm_record(h).unwrap_err().kind(),
            ErrorKind::InvalidRecordHandle
        );
        assert_eq!(
            j.remove_record(h).unwrap_err().kind(),
            ErrorKind::InvalidRecordHandle
        );
        // 越界句柄
        assert_eq!(
            j.confirm_record(999).unwrap_err().kind(),
            ErrorKind::InvalidRecordHandle
        );
    }

    #[test]
    fn test_free_list_growth_order() {
        // 空闲链表 {2,3} 时申请 3 块：先整页增长再弹出,
        // 分到 {4,5,6}，剩余空闲链表为 {7,2,3}
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        let h0 = j.add_record(&[0u8; 16]).unwrap();
        let h1 = j.add_record(&[1u8; 16]).unwrap();
        assert_eq!(h0, 0);
        assert_eq!(h1, 1);
        assert_eq!(j.free_block_indices().unwrap(), vec![2, 3]);

        let h2 = j.add_record(&[2u8; 96]).unwrap(); // 3 块
        assert_eq!(h2, 4);
        assert_eq!(j.free_block_indices().unwrap(), vec![7, 2, 3]);
        assert_eq!(j.num_pages().unwrap(), 2);

        // 释放整链以 O(1) 拼回表头
        j.remove_record(h2).unwrap();
        assert_eq!(j.free_block_indices().unwrap(), vec![4, 5, 6, 7, 2, 3]);
    }

    #[test]
    fn test_highest_block_used_is_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        j.add_record(&[0u8; 16]).unwrap();
        j.add_record(&[1u8; 16]).unwrap();
        let big = j.add_record(&[2u8; 96]).unwrap(); // 块 4,5,6
        assert_eq!(j.highest_block_used().unwrap(), Some(6));

        j.remove_record(big).unwrap();
        assert_eq!(j.highest_block_used().unwrap(), Some(6));

        // 复用空闲块不会推进水位
        let reused = j.add_record(&[3u8; 16]).unwrap();
        assert_eq!(reused, 4);
        assert_eq!(j.highest_block_used().unwrap(), Some(6));
    }

    #[test]
    fn test_handle_reuse_after_remove() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        let h = j.add_record(b"a").unwrap();
        j.remove_record(h).unwrap();
        let h2 = j.add_record(b"b").unwrap();
        assert_eq!(h2, h);
        assert_eq!(j.record_data(h2).unwrap(), b"b");
    }

    #[test]
    fn test_eviction_by_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            max_confirmed_records_kept: 2,
            ..small_config()
        };
        let j = open_rw(&journal_path(&dir), cfg);
        let h1 = j.add_record(b"one").unwrap();
        let h2 = j.add_record(b"two").unwrap();
        let h3 = j.add_record(b"three").unwrap();
        j.confirm_record(h1).unwrap();
        j.confirm_record(h2).unwrap();
        assert_eq!(j.num_confirmed_records().unwrap(), 2);

        // 第三次确认把最旧的 h1 淘汰
        j.confirm_record(h3).unwrap();
        assert_eq!(j.num_confirmed_records().unwrap(), 2);
        let it = j.first_confirmed_record();
        assert_eq!(it.handle(), Some(h2));
    }

    #[test]
    fn test_eviction_zero_limit_drops_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            max_confirmed_records_kept: 0,
            ..small_config()
        };
        let j = open_rw(&journal_path(&dir), cfg);
        let h = j.add_record(b"gone").unwrap();
        j.confirm_record(h).unwrap();
        assert_eq!(j.num_confirmed_records().unwrap(), 0);
        assert!(!j.first_confirmed_record().is_valid());
        // 块已回到空闲链表
        assert_eq!(j.free_block_indices().unwrap()[0], h);
    }

    #[test]
    fn test_eviction_by_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            max_confirmed_bytes_kept: 40,
            ..small_config()
        };
        let j = open_rw(&journal_path(&dir), cfg);
        let h1 = j.add_record(&[1u8; 30]).unwrap();
        let h2 = j.add_record(&[2u8; 30]).unwrap();
        j.confirm_record(h1).unwrap();
        assert_eq!(j.num_confirmed_records().unwrap(), 1);
        // 60 字节超出 40，淘汰最旧的 h1 回到 30 字节
        j.confirm_record(h2).unwrap();
        assert_eq!(j.num_confirmed_records().unwrap(), 1);
        assert_eq!(j.first_confirmed_record().handle(), Some(h2));
    }

    #[test]
    fn test_record_size_limits() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            max_file_size: 8192, // header 区域 4096 + 1 页
            ..small_config()
        };
        let j = open_rw(&journal_path(&dir), cfg);
        assert_eq!(j.max_record_size_for_empty_journal().unwrap(), 128);
        assert_eq!(j.max_record_size().unwrap(), 128);

        // 任何时候都放不下
        assert_eq!(
            j.add_record(&[0u8; 160]).unwrap_err().kind(),
            ErrorKind::MaxRecordSizeForEmptyJournalViolation
        );
        j.add_record(&[0u8; 32]).unwrap();
        assert_eq!(j.max_record_size().unwrap(), 96);
        // 现在放不下（空 journal 可以）
        assert_eq!(
            j.add_record(&[0u8; 128]).unwrap_err().kind(),
            ErrorKind::MaxRecordSizeViolation
        );
        // 失败的 add 不改变状态
        assert_eq!(j.num_records().unwrap(), 1);
    }

    #[test]
    fn test_invalid_max_file_size_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            max_file_size: 4096, // 放不下一页
            ..small_config()
        };
        let err =
            PersistentJournal::open(journal_path(&dir), Mode::ReadWrite, cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMaxFileSize);
    }

    #[test]
    fn test_set_max_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        // 占满两页
        for _ in 0..8 {
            j.add_record(&[7u8; 32]).unwrap();
        }
        assert_eq!(j.num_pages().unwrap(), 2);
        // 低于当前大小的上限被拒绝
        assert_eq!(
            j.set_max_file_size(8192).unwrap_err().kind(),
            ErrorKind::InvalidMaxFileSize
        );
        j.set_max_file_size(3 * 4096).unwrap();
        assert_eq!(j.max_file_size().unwrap(), 3 * 4096);
        assert_eq!(
            j.add_record(&[7u8; 32]).unwrap_err().kind(),
            ErrorKind::MaxRecordSizeViolation
        );
        j.set_max_file_size(-1).unwrap();
        j.add_record(&[7u8; 32]).unwrap();
    }

    #[test]
    fn test_user_data_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let cfg = JournalConfig {
            user_data_size: 16,
            commit_mode: CommitMode::Explicit,
            ..small_config()
        };
        {
            let j = open_rw(&path, cfg);
            j.write_user_data(b"hello journal").unwrap();
            // 超出区域大小被拒绝
            assert!(j.write_user_data(&[0u8; 17]).is_err());
            j.close().unwrap();
        }
        let j = open_rw(&path, small_config());
        assert_eq!(j.user_data_size().unwrap(), 16);
        assert_eq!(&j.user_data().unwrap()[..13], b"hello journal");
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let cfg = JournalConfig {
            commit_mode: CommitMode::Explicit,
            ..small_config()
        };
        let (h1, h2);
        {
            let j = open_rw(&path, cfg);
            h1 = j.add_record(b"keep me").unwrap();
            h2 = j.add_record(&[9u8; 70]).unwrap();
            j.confirm_record(h1).unwrap();
            j.close().unwrap();
        }
        // 附着时采用文件里的几何，这里故意传不同的创建参数
        let j = PersistentJournal::open(
            &path,
            Mode::ReadWrite,
            JournalConfig {
                block_size: 64,
                ..JournalConfig::default()
            },
        )
        .unwrap();
        assert_eq!(j.block_size().unwrap(), 32);
        assert_eq!(j.num_confirmed_records().unwrap(), 1);
        assert_eq!(j.num_unconfirmed_records().unwrap(), 1);
        assert_eq!(j.record_data(h1).unwrap(), b"keep me");
        assert_eq!(j.record_data(h2).unwrap(), vec![9u8; 70]);
    }

    #[test]
    fn test_read_only_mode_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        {
            let j = open_rw(&path, small_config());
            j.add_record(b"ro").unwrap();
            j.close().unwrap();
        }
        let j = PersistentJournal::open(&path, Mode::ReadOnly, small_config()).unwrap();
        assert_eq!(j.num_unconfirmed_records().unwrap(), 1);
        assert_eq!(
            j.add_record(b"nope").unwrap_err().kind(),
            ErrorKind::BadState
        );
        let it = j.first_unconfirmed_record();
        assert_eq!(it.data().unwrap(), b"ro");
    }

    #[test]
    fn test_attach_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        std::fs::write(&path, vec![0u8; 200]).unwrap();
        let err =
            PersistentJournal::open(&path, Mode::ReadWrite, small_config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);

        std::fs::write(&path, b"short").unwrap();
        let err =
            PersistentJournal::open(&path, Mode::ReadWrite, small_config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFile);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        j.add_record(b"x").unwrap();
        j.close().unwrap();
        j.close().unwrap();
        assert_eq!(j.add_record(b"y").unwrap_err().kind(), ErrorKind::BadState);
        assert_eq!(j.num_records().unwrap_err().kind(), ErrorKind::BadState);
        assert!(!j.first_confirmed_record().is_valid());
    }

    #[test]
    fn test_protected_mode_operations() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            protection_mode: ProtectionMode::Protected,
            ..small_config()
        };
        let j = open_rw(&journal_path(&dir), cfg);
        let h = j.add_record(b"guarded").unwrap();
        j.confirm_record(h).unwrap();
        assert_eq!(j.record_data(h).unwrap(), b"guarded");
        j.set_protection_mode(ProtectionMode::Unprotected).unwrap();
        j.remove_record(h).unwrap();
        j.set_protection_mode(ProtectionMode::Protected).unwrap();
        j.add_record(b"again").unwrap();
        j.commit().unwrap();
    }

    #[test]
    fn test_iterator_traversal_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        let handles: Vec<_> = (0..4).map(|i| j.add_record(&[i as u8; 8]).unwrap()).collect();

        let mut it = j.first_unconfirmed_record();
        let mut seen = Vec::new();
        while it.is_valid() {
            seen.push(it.handle().unwrap());
            it.advance();
        }
        assert_eq!(seen, handles);
        drop(it);

        let mut it = j.last_unconfirmed_record();
        let mut seen = Vec::new();
        while it.is_valid() {
            seen.push(it.handle().unwrap());
            it.retreat();
        }
        let reversed: Vec<_> = handles.iter().rev().copied().collect();
        assert_eq!(seen, reversed);
        // 越过端点后失效且不可复位
        assert!(!it.is_valid());
        assert!(!it.retreat());
        assert!(it.data().is_err());
    }

    #[test]
    fn test_iterator_blocks_writers() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        j.add_record(b"held").unwrap();

        let (tx, rx) = mpsc::channel();
        std::thread::scope(|s| {
            let it = j.first_unconfirmed_record();
            let jref = &j;
            s.spawn(move || {
                jref.add_record(b"blocked").unwrap();
                tx.send(()).unwrap();
            });
            // 迭代器持有读锁，写入线程必须等待
            assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
            drop(it);
            assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        });
        assert_eq!(j.num_unconfirmed_records().unwrap(), 2);
    }

    #[test]
    fn test_multi_block_layout_scenario() {
        // blockSize=1024、blocksPerPage=4：100/2000/50 字节的记录
        // 依次占用块 0、{1,2}、3
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            block_size: 1024,
            blocks_per_page: 4,
            alignment_size: 4096,
            ..JournalConfig::default()
        };
        let j = open_rw(&journal_path(&dir), cfg);
        let h1 = j.add_record(&[1u8; 100]).unwrap();
        let h2 = j.add_record(&[2u8; 2000]).unwrap();
        let h3 = j.add_record(&[3u8; 50]).unwrap();
        assert_eq!((h1, h2, h3), (0, 1, 3));
        assert_eq!(j.num_pages().unwrap(), 1);
        assert!(j.free_block_indices().unwrap().is_empty());
        assert_eq!(j.record_data(h2).unwrap(), vec![2u8; 2000]);

        // 第四条记录触发整页增长
        let h4 = j.add_record(&[4u8; 10]).unwrap();
        assert_eq!(h4, 4);
        assert_eq!(j.num_pages().unwrap(), 2);

        // 确认跨块记录、释放首条，再沿已确认链表取回完整数据
        j.confirm_record(h2).unwrap();
        j.remove_record(h1).unwrap();
        assert_eq!(j.num_confirmed_records().unwrap(), 1);
        assert_eq!(j.num_unconfirmed_records().unwrap(), 2);
        assert_eq!(j.free_block_indices().unwrap(), vec![0, 5, 6, 7]);

        let it = j.first_confirmed_record();
        assert_eq!(it.handle(), Some(h2));
        assert_eq!(it.record_length().unwrap(), 2000);
        assert_eq!(it.data().unwrap(), vec![2u8; 2000]);
        drop(it);

        let it = j.first_unconfirmed_record();
        assert_eq!(it.handle(), Some(h3));
    }

    #[test]
    fn test_debug_reports_lifecycle_state() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        assert_eq!(format!("{:?}", j), "PersistentJournal { state: \"open\" }");
        j.close().unwrap();
        assert_eq!(format!("{:?}", j), "PersistentJournal { state: \"closed\" }");
    }

    #[test]
    fn test_from_file_attaches_to_open_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = journal_path(&dir);
        let h;
        {
            let j = open_rw(&path, small_config());
            h = j.add_record(b"via fd").unwrap();
            j.close().unwrap();
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let j = PersistentJournal::from_file(file, Mode::ReadWrite, small_config()).unwrap();
        assert_eq!(j.record_data(h).unwrap(), b"via fd");
        j.confirm_record(h).unwrap();
        assert_eq!(j.num_confirmed_records().unwrap(), 1);

        // 非 journal 内容的句柄被拒绝
        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, vec![0u8; 200]).unwrap();
        let file = std::fs::File::open(&garbage).unwrap();
        assert_eq!(
            PersistentJournal::from_file(file, Mode::ReadOnly, small_config())
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidFile
        );
    }

    #[test]
    fn test_protection_restored_after_failed_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = JournalConfig {
            protection_mode: ProtectionMode::Protected,
            ..small_config()
        };
        let j = open_rw(&journal_path(&dir), cfg);
        j.add_record(b"guarded").unwrap();
        // 失败的变更（中止路径）离开时也必须恢复只读映射
        assert_eq!(
            j.confirm_record(999).unwrap_err().kind(),
            ErrorKind::InvalidRecordHandle
        );
        match &*j.state.read() {
            JournalState::Open(core) => {
                assert!(core.header_map.is_protected());
                assert!(core.pages.iter().all(|p| p.is_protected()));
            }
            JournalState::Closed => unreachable!(),
        }
        // journal 保持可用
        j.add_record(b"still usable").unwrap();
    }

    #[test]
    fn test_print_header_smoke() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        j.add_record(b"dump").unwrap();
        let mut out = Vec::new();
        j.print_header(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("block_size=32"));
        assert!(text.contains("unconfirmed: records=1"));
    }

    #[cfg(unix)]
    #[test]
    fn test_raw_fd_available() {
        let dir = tempfile::tempdir().unwrap();
        let j = open_rw(&journal_path(&dir), small_config());
        assert!(j.raw_fd().unwrap() >= 0);
    }
}
