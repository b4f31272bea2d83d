use indicatif::{ProgressBar, ProgressIterator};
use ::kmeans::{EuclideanDistance, KMeans, KMeansConfig, KMeansState};
use log::{debug, info};
use rand08::SeedableRng;
use rand08::rngs::StdRng;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::utils::{imbalance_factor, l2_sqr, pb_style};

/// 超过该数量的聚类中心使用两级聚类
const TWO_LEVEL_THRESHOLD: usize = 4096;

/// SIMD 宽度
const LANES: usize = 16;

#[derive(Debug, Clone, Default)]
pub struct Clusters {
    /// 所有向量到聚类中心的总距离
    pub distsum: f64,
    /// 聚类中心，长度为 k * d
    pub centroids: Vec<f32>,
    /// 每个聚类中心包含的向量数量
    pub centroid_frequency: Vec<usize>,
}

/// 返回离 `x` 最近的聚类中心序号和平方距离
#[inline]
pub fn nearest_centroid(centroids: &[f32], d: usize, x: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (j, c) in centroids.chunks_exact(d).enumerate() {
        let dis = l2_sqr(x, c);
        if dis < best.1 {
            best = (j, dis);
        }
    }
    best
}

/// 根据聚类中心数量自动选择一级或两级聚类
pub fn train(data: &[f32], d: usize, k: usize, max_iter: usize, seed: u64) -> Result<Clusters> {
    let n = data.len() / d;
    if k >= TWO_LEVEL_THRESHOLD && n >= 30 * k {
        kmeans_2level(data, d, k, max_iter, seed)
    } else {
        kmeans(data, d, k, max_iter, seed)
    }
}

/// 对 n 个 d 维向量进行 k-means 聚类
///
/// 初始中心从样本中随机选取，随机数生成器由 `seed` 决定，相同输入得到相同结果。
pub fn kmeans(data: &[f32], d: usize, k: usize, max_iter: usize, seed: u64) -> Result<Clusters> {
    let n = data.len() / d;
    if n < k || k == 0 {
        return Err(Error::InsufficientSample { sample: n, nlist: k });
    }

    let km: KMeans<_, LANES, _> = KMeans::new(data, n, d, EuclideanDistance);
    let conf = KMeansConfig::build()
        .random_generator(StdRng::seed_from_u64(seed))
        .iteration_done(&|s: &KMeansState<f32>, nr: usize, new_distsum: f32| {
            debug!(
                "第 {} 轮 - 不平衡度：{:.2} | 距离和变化：{:+.4}",
                nr,
                imbalance_factor(&s.centroid_frequency),
                new_distsum - s.distsum
            );
        })
        .build();
    // NOTE: init_kmeanplusplus 会 panic
    let state = km.kmeans_lloyd(k, max_iter, KMeans::init_random_sample, &conf);

    // 中心可能按 SIMD 宽度补齐
    let centroids = state.centroids.to_vec();
    let stride = centroids.len() / k;
    let centroids = if stride == d {
        centroids
    } else {
        centroids.chunks_exact(stride).flat_map(|c| c[..d].iter().copied()).collect()
    };

    Ok(Clusters {
        distsum: state.distsum as f64,
        centroids,
        centroid_frequency: state.centroid_frequency.to_vec(),
    })
}

/// 两级聚类：先聚出 sqrt(k) 个一级中心，再在每个一级簇内部聚类
pub fn kmeans_2level(data: &[f32], d: usize, k: usize, max_iter: usize, seed: u64) -> Result<Clusters> {
    let n = data.len() / d;
    if n < k {
        return Err(Error::InsufficientSample { sample: n, nlist: k });
    }
    let k1 = k.isqrt().max(1);

    let n1 = (k1 * 1024).min(n);
    info!("对 {n1} 组向量进行 1 级聚类，中心点数量 = {k1}");
    let ks = kmeans(&data[..n1 * d], d, k1, max_iter, seed)?;
    info!("1 级聚类完成，不平衡度：{:.2}", imbalance_factor(&ks.centroid_frequency));

    let assignments = data
        .par_chunks_exact(d)
        .map(|x| nearest_centroid(&ks.centroids, d, x).0)
        .collect::<Vec<_>>();
    let mut groups = vec![vec![]; k1];
    for (x, &a) in data.chunks_exact(d).zip(&assignments) {
        groups[a].extend_from_slice(x);
    }

    let sizes = groups.iter().map(|g| g.len() / d).collect::<Vec<_>>();
    let k2 = allocate_centroids(&sizes, k);
    info!(
        "2 级聚类中心点数量：{} ~ {}",
        k2.iter().min().copied().unwrap_or_default(),
        k2.iter().max().copied().unwrap_or_default()
    );

    let mut state = Clusters::default();
    let pb = ProgressBar::new(k1 as u64).with_style(pb_style());
    for i in (0..k1).progress_with(pb.clone()) {
        if k2[i] == 0 {
            continue;
        }
        let ks = kmeans(&groups[i], d, k2[i], max_iter, seed.wrapping_add(i as u64 + 1))?;
        pb.set_message(format!(
            "二级聚类：{} 组向量，中心点数量 = {}，不平衡度 = {:.2}",
            sizes[i],
            k2[i],
            imbalance_factor(&ks.centroid_frequency)
        ));
        state.distsum += ks.distsum;
        state.centroids.extend(ks.centroids);
        state.centroid_frequency.extend(ks.centroid_frequency);
    }
    pb.finish_with_message("二级聚类完成");

    info!("总距离：{:.4}，不平衡度：{:.2}", state.distsum, imbalance_factor(&state.centroid_frequency));
    Ok(state)
}

/// 按簇大小加权分配二级中心数量，保证总和为 k 且不超过簇大小
fn allocate_centroids(sizes: &[usize], k: usize) -> Vec<usize> {
    let total = sizes.iter().sum::<usize>().max(1);
    // 累加和错位相减，保证 sum = k
    let mut acc = 0;
    let mut prev = 0;
    let mut alloc = sizes
        .iter()
        .map(|&s| {
            acc += s;
            let cur = acc * k / total;
            let v = cur - prev;
            prev = cur;
            v.min(s)
        })
        .collect::<Vec<_>>();

    let mut deficit = k - alloc.iter().sum::<usize>();
    while deficit > 0 {
        let Some(i) = (0..sizes.len()).filter(|&i| alloc[i] < sizes[i]).max_by_key(|&i| sizes[i] - alloc[i])
        else {
            break;
        };
        alloc[i] += 1;
        deficit -= 1;
    }
    alloc
}
