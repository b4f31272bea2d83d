use std::borrow::Cow;
use std::cell::RefCell;
use std::fs::File;
use std::io::BufReader;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use binrw::BinRead;
use zstd::bulk::decompress;

use crate::error::{Error, Result};
use crate::ivf::{Fingerprint, InvertedLists, OnDiskIvfMetadata};

thread_local! {
    static READ_BUFFER: RefCell<Vec<u8>> = RefCell::new(vec![0u8; 1024]);
}

/// 磁盘倒排列表
pub struct OnDiskInvlists {
    /// 元数据
    metadata: OnDiskIvfMetadata,
    /// 文件句柄，为空时每次读取都重新打开文件
    file: Option<File>,
    path: PathBuf,
}

impl OnDiskInvlists {
    /// 加载磁盘倒排列表，文件句柄一直保持打开
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let (metadata, file, path) = Self::open(path.as_ref())?;
        Ok(Self { metadata, file: Some(file), path })
    }

    /// 只读取文件头，不保留文件句柄
    ///
    /// 合并时需要同时读取的分片数量可能超过进程的文件描述符上限。
    pub fn load_lazy(path: impl AsRef<Path>) -> Result<Self> {
        let (metadata, _, path) = Self::open(path.as_ref())?;
        Ok(Self { metadata, file: None, path })
    }

    fn open(path: &Path) -> Result<(OnDiskIvfMetadata, File, PathBuf)> {
        let path = path.to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();

        let corrupted = |reason: String| Error::Corrupted { path: path.clone(), reason };

        let metadata = OnDiskIvfMetadata::read(&mut BufReader::new(&file))
            .map_err(|e| corrupted(format!("无法读取文件头: {e}")))?;

        for i in 0..metadata.nlist as usize {
            let end = metadata.list_offset[i] + metadata.list_size[i];
            if end > file_len || metadata.list_split[i] > metadata.list_size[i] {
                return Err(corrupted(format!("倒排列表 {i} 超出文件范围")));
            }
        }

        Ok((metadata, file, path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.metadata.fingerprint()
    }

    // 加载一个倒排列表的长度，偏移量、大小和分割点
    fn list_info(&self, list_no: usize) -> (usize, u64, usize, usize) {
        let len = self.metadata.list_len[list_no] as usize;
        let offset = self.metadata.list_offset[list_no];
        let size = self.metadata.list_size[list_no] as usize;
        let split = self.metadata.list_split[list_no] as usize;
        (len, offset, size, split)
    }
}

impl InvertedLists for OnDiskInvlists {
    #[inline(always)]
    fn nlist(&self) -> usize {
        self.metadata.nlist as usize
    }

    #[inline(always)]
    fn code_size(&self) -> usize {
        self.metadata.code_size as usize
    }

    #[inline(always)]
    fn list_len(&self, list_no: usize) -> usize {
        self.metadata.list_len[list_no] as usize
    }

    fn get_list(&self, list_no: usize) -> Result<(Cow<'_, [u64]>, Cow<'_, [u8]>)> {
        let (len, offset, size, split) = self.list_info(list_no);
        if len == 0 {
            return Ok((Cow::Owned(vec![]), Cow::Owned(vec![])));
        }

        // 使用线程局部缓冲区来避免频繁的内存分配
        READ_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.resize(size, 0);

            // 大部分读取为一次性的随机读取，使用 pread 而不是 mmap
            match &self.file {
                Some(file) => file.read_exact_at(&mut buf, offset)?,
                None => File::open(&self.path)?.read_exact_at(&mut buf, offset)?,
            }

            let (ids, codes) = buf.split_at(split);
            let ids = decompress(ids, len * size_of::<u64>())?;
            let codes = decompress(codes, len * self.code_size())?;

            if ids.len() != len * size_of::<u64>() || codes.len() != len * self.code_size() {
                return Err(Error::Corrupted {
                    path: self.path.clone(),
                    reason: format!("倒排列表 {list_no} 长度不一致"),
                });
            }
            Ok((Cow::Owned(bytemuck::pod_collect_to_vec(&ids)), Cow::Owned(codes)))
        })
    }
}
