use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::ivf::InvertedLists;

/// 内存中的倒排列表，用于构建分片
#[derive(Debug, Clone)]
pub struct ArrayInvertedLists {
    code_size: usize,
    codes: Vec<Vec<u8>>,
    ids: Vec<Vec<u64>>,
}

impl ArrayInvertedLists {
    pub fn new(nlist: usize, code_size: usize) -> Self {
        Self { code_size, codes: vec![vec![]; nlist], ids: vec![vec![]; nlist] }
    }

    /// 往指定倒排表中批量添加元素，`codes` 长度必须为 `ids.len() * code_size`
    pub fn add_entries(&mut self, list_no: usize, ids: &[u64], codes: &[u8]) -> Result<()> {
        if codes.len() != ids.len() * self.code_size {
            return Err(Error::DimensionMismatch {
                expected: ids.len() * self.code_size,
                actual: codes.len(),
            });
        }
        self.ids[list_no].extend_from_slice(ids);
        self.codes[list_no].extend_from_slice(codes);
        Ok(())
    }

    pub fn add_entry(&mut self, list_no: usize, id: u64, code: &[u8]) -> Result<()> {
        self.add_entries(list_no, &[id], code)
    }
}

impl InvertedLists for ArrayInvertedLists {
    fn nlist(&self) -> usize {
        self.ids.len()
    }

    fn code_size(&self) -> usize {
        self.code_size
    }

    fn list_len(&self, list_no: usize) -> usize {
        self.ids[list_no].len()
    }

    fn get_list(&self, list_no: usize) -> Result<(Cow<'_, [u64]>, Cow<'_, [u8]>)> {
        Ok((Cow::Borrowed(&self.ids[list_no]), Cow::Borrowed(&self.codes[list_no])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_entries() {
        let mut invlists = ArrayInvertedLists::new(2, 2);
        invlists.add_entries(1, &[3, 4], &[1, 1, 2, 2]).unwrap();
        invlists.add_entry(1, 5, &[3, 3]).unwrap();
        assert_eq!(invlists.list_len(0), 0);
        assert_eq!(invlists.list_len(1), 3);
        assert_eq!(invlists.ntotal(), 3);

        let (ids, codes) = invlists.get_list(1).unwrap();
        assert_eq!(&*ids, &[3, 4, 5]);
        assert_eq!(&*codes, &[1, 1, 2, 2, 3, 3]);

        assert!(invlists.add_entry(0, 6, &[1]).is_err());
    }
}
