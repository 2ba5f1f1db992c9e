//! 线程安全、崩溃容忍的文件背书持久化记录 journal
//!
//! journal 是记录的有序集合：记录先以**未确认**状态进入，处理完毕
//! 后**确认**；两类记录各自挂在一条磁盘上的双向链表里。已确认记录
//! 按确认顺序保留，可配置保留上限（条数/字节数），超限时从最旧端
//! 淘汰。全部状态都在内存映射的文件里，进程崩溃后重新打开即恢复到
//! 上一次提交的状态。
//!
//! # 使用示例
//!
//! ```no_run
//! use pjournal_core::{JournalConfig, Mode, PersistentJournal};
//!
//! # fn main() -> pjournal_core::Result<()> {
//! let journal = PersistentJournal::open(
//!     "work.journal",
//!     Mode::ReadWrite,
//!     JournalConfig::default(),
//! )?;
//! let handle = journal.add_record(b"pending work item")?;
//! // ... 处理完毕后确认
//! journal.confirm_record(handle)?;
//! journal.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! # 模块划分
//!
//! - [`journal`]：对外门面、打开/创建、迭代器
//! - [`header`]：文件头与链表状态的磁盘编码
//! - [`types`]：块头表项等磁盘数据结构
//! - [`mapping`]：页几何计算与内存映射/保护
//! - [`error`]：错误类型
//!
//! 分配器、记录链表与事务管理是内部模块，不对外暴露。

pub mod consts;
pub mod error;
pub mod header;
pub mod journal;
pub mod mapping;
pub mod types;

mod balloc;
mod list;
mod txn;

pub use error::{Error, ErrorKind, Result};
pub use journal::{
    CommitMode, JournalConfig, Mode, PersistentJournal, ProtectionMode, RecordIterator,
};
pub use types::RecordHandle;
