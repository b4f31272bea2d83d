mod array_invlists;
mod ondisk_invlists;
mod vstack_invlists;

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

pub use array_invlists::*;
use binrw::{BinWrite, binrw};
use bytemuck::cast_slice;
use indicatif::{ProgressBar, ProgressIterator};
pub use ondisk_invlists::*;
pub use vstack_invlists::*;
use zstd::bulk::compress;

use crate::error::Result;
use crate::ivf::Fingerprint;
use crate::utils::{imbalance_factor, tmp_path};

pub trait InvertedLists {
    /// 返回倒排表的列表数量
    fn nlist(&self) -> usize;

    /// 返回每个编码的字节数
    fn code_size(&self) -> usize;

    /// 返回指定倒排表的元素数量
    fn list_len(&self, list_no: usize) -> usize;

    /// 返回指定倒排表中向量的 ID 列表和编码，编码长度为 `list_len * code_size`
    fn get_list(&self, list_no: usize) -> Result<(Cow<'_, [u64]>, Cow<'_, [u8]>)>;

    /// 所有倒排表的元素总数
    fn ntotal(&self) -> usize {
        (0..self.nlist()).map(|i| self.list_len(i)).sum()
    }

    /// 计算不平衡度
    fn imbalance(&self) -> f32 {
        let hist = (0..self.nlist()).map(|i| self.list_len(i)).collect::<Vec<_>>();
        imbalance_factor(&hist)
    }
}

/// 保存到文件
pub fn save_invlists<T>(invlists: &T, fingerprint: Fingerprint, path: impl AsRef<Path>) -> Result<()>
where
    T: InvertedLists + ?Sized,
{
    save_invlists_with_progress(invlists, fingerprint, path, ProgressBar::hidden())
}

/// 保存到文件，并通过进度条报告已写入的倒排列表数量
pub fn save_invlists_with_progress<T>(
    invlists: &T,
    fingerprint: Fingerprint,
    path: impl AsRef<Path>,
    pb: ProgressBar,
) -> Result<()>
where
    T: InvertedLists + ?Sized,
{
    let path = path.as_ref();
    let tmp = tmp_path(path);
    let file = File::create(&tmp)?;
    let mut writer = BufWriter::new(file);

    // 提前写入 metadata 占位，后续再来覆盖
    let mut metadata = OnDiskIvfMetadata::new(fingerprint, invlists.nlist(), invlists.code_size());
    metadata.write(&mut writer)?;

    // offset 为文件内的绝对偏移量
    let mut offset = writer.stream_position()?;
    pb.set_length(invlists.nlist() as u64);
    for i in (0..invlists.nlist()).progress_with(pb) {
        let (ids, codes) = invlists.get_list(i)?;
        write_one_list(&mut writer, &mut metadata, i, &ids, &codes, &mut offset)?;
    }

    writer.seek(SeekFrom::Start(0))?;
    metadata.write(&mut writer)?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[binrw]
#[brw(little, magic = b"PWIVF001")]
pub struct OnDiskIvfMetadata {
    /// 量化器指纹
    pub fingerprint: [u8; 32],
    /// 倒排列表数量
    pub nlist: u64,
    /// 向量字节数
    pub code_size: u64,
    /// 每个倒排列表的元素数量
    #[br(count = nlist)]
    pub list_len: Vec<u64>,
    /// 倒排列表在整个文件中的偏移量
    #[br(count = nlist)]
    pub list_offset: Vec<u64>,
    /// 倒排列表的总大小
    #[br(count = nlist)]
    pub list_size: Vec<u64>,
    /// 单个倒排列表中 id 和 code 部分的分割点
    #[br(count = nlist)]
    pub list_split: Vec<u64>,
}

impl OnDiskIvfMetadata {
    pub fn new(fingerprint: Fingerprint, nlist: usize, code_size: usize) -> Self {
        Self {
            fingerprint: fingerprint.0,
            nlist: nlist as u64,
            code_size: code_size as u64,
            list_len: vec![0; nlist],
            list_offset: vec![0; nlist],
            list_size: vec![0; nlist],
            list_split: vec![0; nlist],
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(self.fingerprint)
    }
}

fn write_one_list<W: Write>(
    writer: &mut W,
    metadata: &mut OnDiskIvfMetadata,
    list_no: usize,
    ids: &[u64],
    codes: &[u8],
    offset: &mut u64,
) -> Result<()> {
    metadata.list_len[list_no] = ids.len() as u64;

    let ids = compress(cast_slice(ids), 0)?;
    let codes = compress(codes, 0)?;
    let size = (ids.len() + codes.len()) as u64;

    metadata.list_offset[list_no] = *offset;
    metadata.list_size[list_no] = size;
    metadata.list_split[list_no] = ids.len() as u64;

    *offset += size;

    writer.write_all(&ids)?;
    writer.write_all(&codes)?;
    Ok(())
}
