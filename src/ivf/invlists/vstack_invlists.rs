use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::ivf::InvertedLists;

/// 垂直堆叠多个倒排列表，通常用于合并工作
///
/// 每次只读取一个倒排列表，按传入顺序拼接，不排序也不去重。
pub struct VStackInvlists<T> {
    nlist: usize,
    code_size: usize,
    invlists: Vec<T>,
}

impl<T> VStackInvlists<T>
where
    T: InvertedLists,
{
    pub fn new(invlists: Vec<T>) -> Result<Self> {
        let Some(first) = invlists.first() else {
            return Err(Error::Config("没有可合并的倒排列表".to_string()));
        };
        let (nlist, code_size) = (first.nlist(), first.code_size());
        for invlist in &invlists {
            if invlist.nlist() != nlist || invlist.code_size() != code_size {
                return Err(Error::Config(format!(
                    "倒排列表结构不一致：nlist {} / {nlist}，code_size {} / {code_size}",
                    invlist.nlist(),
                    invlist.code_size()
                )));
            }
        }
        Ok(Self { nlist, code_size, invlists })
    }
}

impl<T> InvertedLists for VStackInvlists<T>
where
    T: InvertedLists,
{
    fn nlist(&self) -> usize {
        self.nlist
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn list_len(&self, list_no: usize) -> usize {
        self.invlists.iter().map(|invlist| invlist.list_len(list_no)).sum()
    }

    fn get_list(&self, list_no: usize) -> Result<(Cow<'_, [u64]>, Cow<'_, [u8]>)> {
        let len = self.list_len(list_no);
        let mut ids: Vec<u64> = Vec::with_capacity(len);
        let mut codes: Vec<u8> = Vec::with_capacity(len * self.code_size);
        for invlist in &self.invlists {
            let (i, c) = invlist.get_list(list_no)?;
            ids.extend_from_slice(&i);
            codes.extend_from_slice(&c);
        }
        Ok((Cow::Owned(ids), Cow::Owned(codes)))
    }
}
