use std::fs;

use pwsearch::Error;
use pwsearch::ivf::{ArrayInvertedLists, Fingerprint, InvertedLists, OnDiskInvlists, VStackInvlists, save_invlists};
use rstest::*;
use tempfile::TempDir;

const N: usize = 4;
const FINGERPRINT: Fingerprint = Fingerprint([7; 32]);

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

#[fixture]
fn sample_data() -> (Vec<u64>, Vec<u8>) {
    let ids = vec![1, 2, 3, 4, 5];
    let codes = vec![
        0x01, 0x02, 0x03, 0x04, //
        0x11, 0x12, 0x13, 0x14, //
        0x21, 0x22, 0x23, 0x24, //
        0x31, 0x32, 0x33, 0x34, //
        0x41, 0x42, 0x43, 0x44,
    ];
    (ids, codes)
}

#[fixture]
fn populated_array_invlists(sample_data: (Vec<u64>, Vec<u8>)) -> ArrayInvertedLists {
    let (ids, codes) = sample_data;
    let mut invlist = ArrayInvertedLists::new(3, N);

    // 分配数据到不同的列表
    invlist.add_entries(0, &ids[0..2], &codes[0..2 * N]).unwrap();
    invlist.add_entries(1, &ids[2..4], &codes[2 * N..4 * N]).unwrap();
    invlist.add_entries(2, &ids[4..5], &codes[4 * N..5 * N]).unwrap();

    invlist
}

#[rstest]
fn test_array_invlists_creation() {
    let invlist = ArrayInvertedLists::new(5, N);
    assert_eq!(invlist.nlist(), 5);
    assert_eq!(invlist.code_size(), N);
    for i in 0..5 {
        assert_eq!(invlist.list_len(i), 0);
    }
}

#[rstest]
fn test_array_invlists_get_list(populated_array_invlists: ArrayInvertedLists) {
    let invlist = populated_array_invlists;

    let (ids, codes) = invlist.get_list(0).unwrap();
    assert_eq!(ids.as_ref(), &[1, 2]);
    assert_eq!(codes.as_ref(), &[0x01, 0x02, 0x03, 0x04, 0x11, 0x12, 0x13, 0x14]);

    let (ids, codes) = invlist.get_list(2).unwrap();
    assert_eq!(ids.as_ref(), &[5]);
    assert_eq!(codes.as_ref(), &[0x41, 0x42, 0x43, 0x44]);
}

#[rstest]
fn test_array_invlists_imbalance(populated_array_invlists: ArrayInvertedLists) {
    // 列表长度为 [2, 2, 1]，imbalance = (4 + 4 + 1) * 3 / 25 = 1.08
    assert!((populated_array_invlists.imbalance() - 1.08).abs() < 0.01);
}

#[rstest]
fn test_array_invlists_add_entries_mismatch() {
    let mut invlist = ArrayInvertedLists::new(2, N);
    let result = invlist.add_entries(0, &[1, 2, 3], &[0x01; 2 * N]);
    assert!(matches!(result, Err(Error::DimensionMismatch { expected: 12, actual: 8 })));
    assert_eq!(invlist.list_len(0), 0);
}

#[rstest]
fn test_ondisk_invlists_load_nonexistent(temp_dir: TempDir) {
    let result = OnDiskInvlists::load(temp_dir.path().join("nonexistent.ivf"));
    assert!(matches!(result, Err(Error::Io(_))));
}

#[rstest]
fn test_ondisk_invlists_load_garbage(temp_dir: TempDir) {
    let file_path = temp_dir.path().join("garbage.ivf");
    fs::write(&file_path, b"not an index").unwrap();
    let result = OnDiskInvlists::load(&file_path);
    assert!(matches!(result, Err(Error::Corrupted { .. })));
}

#[rstest]
fn test_ondisk_invlists_truncated(populated_array_invlists: ArrayInvertedLists, temp_dir: TempDir) {
    let file_path = temp_dir.path().join("truncated.ivf");
    save_invlists(&populated_array_invlists, FINGERPRINT, &file_path).unwrap();

    let bytes = fs::read(&file_path).unwrap();
    fs::write(&file_path, &bytes[..bytes.len() - 4]).unwrap();
    let result = OnDiskInvlists::load(&file_path);
    assert!(matches!(result, Err(Error::Corrupted { .. })));
}

#[rstest]
fn test_ondisk_invlists_from_array(populated_array_invlists: ArrayInvertedLists, temp_dir: TempDir) {
    let array_invlist = populated_array_invlists;
    let file_path = temp_dir.path().join("shard.0.ivf");

    save_invlists(&array_invlist, FINGERPRINT, &file_path).unwrap();
    assert!(!file_path.with_file_name("shard.0.ivf.tmp").exists());

    let disk_invlist = OnDiskInvlists::load(&file_path).unwrap();
    assert_eq!(disk_invlist.fingerprint(), FINGERPRINT);
    assert_eq!(disk_invlist.nlist(), array_invlist.nlist());
    assert_eq!(disk_invlist.code_size(), N);
    assert_eq!(disk_invlist.ntotal(), 5);

    for i in 0..disk_invlist.nlist() {
        let (array_ids, array_codes) = array_invlist.get_list(i).unwrap();
        let (disk_ids, disk_codes) = disk_invlist.get_list(i).unwrap();

        assert_eq!(array_ids.as_ref(), disk_ids.as_ref());
        assert_eq!(array_codes.as_ref(), disk_codes.as_ref());
    }
}

#[rstest]
fn test_vstack_multiple(sample_data: (Vec<u64>, Vec<u8>), temp_dir: TempDir) {
    let (ids, codes) = sample_data;

    let mut invlist1 = ArrayInvertedLists::new(2, N);
    invlist1.add_entries(0, &ids[0..2], &codes[0..2 * N]).unwrap();
    invlist1.add_entries(1, &ids[2..3], &codes[2 * N..3 * N]).unwrap();

    let mut invlist2 = ArrayInvertedLists::new(2, N);
    invlist2.add_entries(0, &ids[3..4], &codes[3 * N..4 * N]).unwrap();
    invlist2.add_entries(1, &ids[4..5], &codes[4 * N..5 * N]).unwrap();

    let stacked = VStackInvlists::new(vec![invlist1, invlist2]).unwrap();
    assert_eq!(stacked.list_len(0), 3);
    assert_eq!(stacked.list_len(1), 2);

    let file_path = temp_dir.path().join("index.ivfdata");
    save_invlists(&stacked, FINGERPRINT, &file_path).unwrap();

    let merged = OnDiskInvlists::load(&file_path).unwrap();
    assert_eq!(merged.nlist(), 2);
    assert_eq!(merged.ntotal(), 5);

    // 按分片顺序拼接
    let (merged_ids, merged_codes) = merged.get_list(0).unwrap();
    assert_eq!(merged_ids.as_ref(), &[1, 2, 4]);
    assert_eq!(&merged_codes[2 * N..], &codes[3 * N..4 * N]);
    let (merged_ids, _) = merged.get_list(1).unwrap();
    assert_eq!(merged_ids.as_ref(), &[3, 5]);
}

#[rstest]
fn test_vstack_empty_lists(temp_dir: TempDir) {
    let stacked = VStackInvlists::new(vec![ArrayInvertedLists::new(3, N), ArrayInvertedLists::new(3, N)]).unwrap();

    let file_path = temp_dir.path().join("merged_empty.ivf");
    save_invlists(&stacked, FINGERPRINT, &file_path).unwrap();

    let merged = OnDiskInvlists::load(&file_path).unwrap();
    assert_eq!(merged.nlist(), 3);
    for i in 0..3 {
        assert_eq!(merged.list_len(i), 0);
        let (ids, codes) = merged.get_list(i).unwrap();
        assert!(ids.is_empty());
        assert!(codes.is_empty());
    }
    assert_eq!(merged.imbalance(), 0.0);
}

#[rstest]
fn test_vstack_rejects_mismatch() {
    let result = VStackInvlists::new(vec![ArrayInvertedLists::new(3, N), ArrayInvertedLists::new(2, N)]);
    assert!(matches!(result, Err(Error::Config(_))));

    let result = VStackInvlists::<ArrayInvertedLists>::new(vec![]);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[rstest]
fn test_imbalance_calculation_edge_cases() {
    let ids = vec![1, 2, 3, 4, 5, 6];
    let codes = vec![0x01; 6 * N];

    // 完全平衡
    let mut invlist = ArrayInvertedLists::new(3, N);
    invlist.add_entries(0, &ids[0..2], &codes[0..2 * N]).unwrap();
    invlist.add_entries(1, &ids[2..4], &codes[2 * N..4 * N]).unwrap();
    invlist.add_entries(2, &ids[4..6], &codes[4 * N..6 * N]).unwrap();
    assert_eq!(invlist.imbalance(), 1.0);

    // 所有元素都在一个列表中
    let mut invlist = ArrayInvertedLists::new(2, N);
    invlist.add_entries(0, &ids, &codes).unwrap();
    assert_eq!(invlist.imbalance(), 2.0);
}

#[rstest]
fn test_large_batch_roundtrip(temp_dir: TempDir) {
    let mut invlist = ArrayInvertedLists::new(1, N);
    let large_ids: Vec<u64> = (0..10000).collect();
    let large_codes: Vec<u8> = (0..10000).flat_map(|i| [(i % 256) as u8; N]).collect();
    invlist.add_entries(0, &large_ids, &large_codes).unwrap();

    let file_path = temp_dir.path().join("large.ivf");
    save_invlists(&invlist, FINGERPRINT, &file_path).unwrap();
    let disk_invlist = OnDiskInvlists::load(&file_path).unwrap();

    let (ids, codes) = disk_invlist.get_list(0).unwrap();
    assert_eq!(ids.as_ref(), large_ids.as_slice());
    assert_eq!(codes.as_ref(), large_codes.as_slice());
}

#[cfg(target_os = "linux")]
fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

#[rstest]
#[cfg(target_os = "linux")]
fn test_vstack_many_lazy_shards(temp_dir: TempDir) {
    let nshards = 400;
    let mut paths = vec![];
    for i in 0..nshards {
        let mut invlist = ArrayInvertedLists::new(2, N);
        invlist.add_entry(i % 2, i as u64, &[i as u8; N]).unwrap();
        let path = temp_dir.path().join(format!("shard.{i}.ivf"));
        save_invlists(&invlist, FINGERPRINT, &path).unwrap();
        paths.push(path);
    }

    let before = open_fds();
    let shards = paths.iter().map(OnDiskInvlists::load_lazy).collect::<Result<Vec<_>, _>>().unwrap();
    // 不为每个分片保留文件句柄
    assert!(open_fds() < before + nshards / 2);

    let stacked = VStackInvlists::new(shards).unwrap();
    let file_path = temp_dir.path().join("index.ivfdata");
    save_invlists(&stacked, FINGERPRINT, &file_path).unwrap();

    let merged = OnDiskInvlists::load(&file_path).unwrap();
    assert_eq!(merged.ntotal(), nshards);
    let (ids, codes) = merged.get_list(1).unwrap();
    assert_eq!(ids.len(), nshards / 2);
    assert!(ids.iter().all(|id| id % 2 == 1));
    assert_eq!(&codes[..N], &[1; N]);
}
