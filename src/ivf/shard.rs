use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use log::info;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::ivf::{
    ArrayInvertedLists, InvertedLists, IvfQuantizer, OnDiskInvlists, VStackInvlists, save_invlists,
    save_invlists_with_progress,
};
use crate::utils::pb_style;

/// 将一批 (id, 向量) 分配到各个倒排列表，得到一个内存中的分片
///
/// `vectors` 为按行排列的 `ids.len() * dimension` 个浮点数。
pub fn build_shard(quantizer: &IvfQuantizer, ids: &[u64], vectors: &[f32]) -> Result<ArrayInvertedLists> {
    if !quantizer.is_trained() {
        return Err(Error::UntrainedQuantizer);
    }
    let d = quantizer.dimension();
    if vectors.len() != ids.len() * d {
        return Err(Error::DimensionMismatch { expected: ids.len() * d, actual: vectors.len() });
    }

    let lists = quantizer.assign(vectors);
    let codes = vectors
        .par_chunks_exact(d)
        .zip(lists.par_iter())
        .map(|(x, &list_no)| {
            let mut code = Vec::with_capacity(quantizer.code_size());
            quantizer.encode(x, list_no, &mut code);
            code
        })
        .collect::<Vec<_>>();

    let mut invlists = ArrayInvertedLists::new(quantizer.nlist(), quantizer.code_size());
    for ((&id, &list_no), code) in ids.iter().zip(&lists).zip(&codes) {
        invlists.add_entry(list_no, id, code)?;
    }
    Ok(invlists)
}

/// 将分片写入磁盘，文件头中记录量化器指纹
pub fn write_shard(quantizer: &IvfQuantizer, shard: &ArrayInvertedLists, path: impl AsRef<Path>) -> Result<()> {
    save_invlists(shard, quantizer.fingerprint()?, path)
}

/// 合并结果
#[derive(Debug, Clone)]
pub struct MergeStats {
    pub shards: usize,
    pub ntotal: usize,
    pub imbalance: f32,
}

/// 按顺序合并多个分片，逐个倒排列表流式写入 `output`
///
/// 任何一个分片的指纹与量化器不一致时返回错误，并列出所有不一致的分片。
pub fn merge_shards(quantizer: &IvfQuantizer, shards: &[PathBuf], output: impl AsRef<Path>) -> Result<MergeStats> {
    let expected = quantizer.fingerprint()?;

    let invlists = shards.iter().map(OnDiskInvlists::load_lazy).collect::<Result<Vec<_>>>()?;
    let mismatched = invlists
        .iter()
        .filter(|invlist| invlist.fingerprint() != expected)
        .map(|invlist| invlist.path().to_path_buf())
        .collect::<Vec<_>>();
    if !mismatched.is_empty() {
        return Err(Error::ShardQuantizerMismatch { expected: expected.to_string(), shards: mismatched });
    }

    let stacked = VStackInvlists::new(invlists)?;
    let stats = MergeStats { shards: shards.len(), ntotal: stacked.ntotal(), imbalance: stacked.imbalance() };
    info!("合并 {} 个分片，共 {} 条向量，不平衡度 {:.2}", stats.shards, stats.ntotal, stats.imbalance);

    let pb = ProgressBar::no_length().with_style(pb_style());
    pb.set_message("合并倒排列表");
    save_invlists_with_progress(&stacked, expected, output, pb)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecKind;

    fn trained(d: usize, nlist: usize) -> (IvfQuantizer, Vec<f32>) {
        let data = (0..64 * d).map(|i| ((i / d) % 8) as f32 + (i % d) as f32 * 0.1).collect::<Vec<_>>();
        let mut quantizer = IvfQuantizer::new(d, nlist, CodecKind::Flat);
        quantizer.train(&data, 10, 42).unwrap();
        (quantizer, data)
    }

    #[test]
    fn test_build_untrained() {
        let quantizer = IvfQuantizer::new(2, 2, CodecKind::Flat);
        let err = build_shard(&quantizer, &[0], &[0.0, 0.0]).unwrap_err();
        assert!(matches!(err, Error::UntrainedQuantizer));
    }

    #[test]
    fn test_build_and_merge() {
        let (quantizer, data) = trained(4, 4);
        let dir = tempfile::tempdir().unwrap();

        let mut paths = vec![];
        for (i, chunk) in data.chunks(16 * 4).enumerate() {
            let ids = (i as u64 * 16..(i as u64 + 1) * 16).collect::<Vec<_>>();
            let shard = build_shard(&quantizer, &ids, chunk).unwrap();
            let path = dir.path().join(format!("shard.{i}.ivf"));
            write_shard(&quantizer, &shard, &path).unwrap();
            paths.push(path);
        }

        let output = dir.path().join("index.ivfdata");
        let stats = merge_shards(&quantizer, &paths, &output).unwrap();
        assert_eq!(stats.shards, 4);
        assert_eq!(stats.ntotal, 64);

        let merged = OnDiskInvlists::load(&output).unwrap();
        assert_eq!(merged.ntotal(), 64);
        let mut all_ids = vec![];
        for i in 0..merged.nlist() {
            let (ids, codes) = merged.get_list(i).unwrap();
            assert_eq!(codes.len(), ids.len() * quantizer.code_size());
            // 同一个倒排列表内保持分片顺序
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all_ids.extend_from_slice(&ids);
        }
        all_ids.sort();
        assert_eq!(all_ids, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_merge_mismatch() {
        let (quantizer, data) = trained(4, 4);
        let (other, _) = trained(4, 2);
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("shard.0.ivf");
        let bad = dir.path().join("shard.1.ivf");
        write_shard(&quantizer, &build_shard(&quantizer, &[0], &data[..4]).unwrap(), &good).unwrap();
        write_shard(&other, &build_shard(&other, &[1], &data[4..8]).unwrap(), &bad).unwrap();

        match merge_shards(&quantizer, &[good, bad.clone()], dir.path().join("index.ivfdata")) {
            Err(Error::ShardQuantizerMismatch { shards, .. }) => assert_eq!(shards, vec![bad]),
            other => panic!("unexpected result: {:?}", other.map(|s| s.ntotal)),
        }
    }
}
