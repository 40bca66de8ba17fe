//! Integration tests driving the public `BlockProcessor` API directly
//! against the scenarios from spec.md §8.

use std::io::Cursor;

use sqfsimg::compressor::{BlockCompressor, Compressor};
use sqfsimg::dedup::DedupPolicy;
use sqfsimg::file::FileOptions;
use sqfsimg::processor::{BlockProcessor, BlockProcessorConfig};

const BLOCK_SIZE: u32 = 128 * 1024;

fn config(num_workers: usize) -> BlockProcessorConfig {
    let mut cfg = BlockProcessorConfig::new(BLOCK_SIZE, num_workers);
    // Deterministic, allocation-free compression keeps these tests fast
    // and focused on the processor's own logic rather than a codec's.
    cfg.compressor = BlockCompressor::new(Compressor::None, None);
    cfg
}

/// A reproducible pseudo-random byte stream (xorshift), so "random"
/// content is stable across test runs without pulling in a rand crate.
fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

#[test]
fn s1_two_identical_files_share_blocks_and_fragment() {
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, config(2));
    let content = pseudo_random(300 * 1024, 42);

    let f1 = proc.new_file(FileOptions::default());
    proc.append_to_file(f1, &content).unwrap();
    proc.finish_file(f1).unwrap();

    let f2 = proc.new_file(FileOptions::default());
    proc.append_to_file(f2, &content).unwrap();
    proc.finish_file(f2).unwrap();

    let (report, _) = proc.finish().unwrap();

    // 300 KiB = 2 full 128 KiB blocks + a 44 KiB tail, submitted once per
    // file; the second file's blocks and fragment should all hit the
    // dedup indices.
    assert_eq!(report.stats.blocks_written, 2);
    assert_eq!(report.stats.blocks_deduped, 2);
    assert_eq!(report.fragment_table.len(), 1);
    assert_eq!(report.fragment_dedup_hits, 1);

    let f1r = &report.files[&f1];
    let f2r = &report.files[&f2];
    assert_eq!(f1r.block_size_words, f2r.block_size_words);
    assert_eq!(f1r.fragment.unwrap().offset, f2r.fragment.unwrap().offset);
}

#[test]
fn s2_incompressible_block_is_stored_uncompressed_at_full_size() {
    let mut cfg = config(1);
    cfg.compressor = BlockCompressor::new(Compressor::None, None);
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, cfg);
    let block = pseudo_random(BLOCK_SIZE as usize, 7);

    let f = proc.new_file(FileOptions::default());
    proc.append_to_file(f, &block).unwrap();
    proc.finish_file(f).unwrap();
    let (report, _) = proc.finish().unwrap();

    let size_word = report.files[&f].block_size_words[0];
    assert_eq!(size_word & 0x00ff_ffff, BLOCK_SIZE);
    assert_eq!(size_word & (1 << 24), 1 << 24, "uncompressed bit must be set");
}

#[test]
fn s3_sparse_file_records_zero_size_words_and_contiguous_offset() {
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, config(1));
    let zeros = vec![0u8; BLOCK_SIZE as usize];

    let f = proc.new_file(FileOptions::default());
    for _ in 0..8 {
        proc.append_to_file(f, &zeros).unwrap();
    }
    proc.finish_file(f).unwrap();
    let (report, _) = proc.finish().unwrap();

    let fr = &report.files[&f];
    assert_eq!(fr.block_size_words.len(), 8);
    assert!(fr.block_size_words.iter().all(|&w| w == 0));
    assert_eq!(report.bytes_used, fr.data_start.unwrap());
}

#[test]
fn s4_ten_equal_tails_pack_into_one_fragment_block() {
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, config(2));
    let tail = pseudo_random(30 * 1024, 99);

    let mut ids = Vec::new();
    for _ in 0..10 {
        let f = proc.new_file(FileOptions::default());
        proc.append_to_file(f, &tail).unwrap();
        proc.finish_file(f).unwrap();
        ids.push(f);
    }
    let (report, _) = proc.finish().unwrap();

    assert_eq!(report.fragment_table.len(), 1);
    for id in ids {
        assert!(report.files[&id].fragment.is_some());
    }
}

#[test]
fn s4b_distinct_tails_pack_into_at_most_three_fragment_blocks() {
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, config(2));

    for i in 0..10u64 {
        let tail = pseudo_random(30 * 1024, 1000 + i);
        let f = proc.new_file(FileOptions::default());
        proc.append_to_file(f, &tail).unwrap();
        proc.finish_file(f).unwrap();
    }
    let (report, _) = proc.finish().unwrap();

    // 10 * 30 KiB = 300 KiB, block_size 128 KiB => ceil(300/128) = 3.
    assert!(report.fragment_table.len() <= 3);
}

#[test]
fn s7_worker_count_invariance() {
    let content = pseudo_random(500 * 1024, 5);
    let mut last: Option<(Vec<u32>, Vec<u8>)> = None;

    for &num_workers in &[0usize, 1, 2, 8] {
        let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, config(num_workers));
        let f = proc.new_file(FileOptions::default());
        for chunk in content.chunks(37 * 1024) {
            proc.append_to_file(f, chunk).unwrap();
        }
        proc.finish_file(f).unwrap();
        let (report, out) = proc.finish().unwrap();
        let bytes = out.into_inner();

        let current = (report.files[&f].block_size_words.clone(), bytes);
        if let Some(prev) = &last {
            assert_eq!(prev.0, current.0, "block list differs across worker counts");
            assert_eq!(prev.1, current.1, "output bytes differ across worker counts");
        }
        last = Some(current);
    }
}

#[test]
fn s8_dont_deduplicate_forces_two_copies() {
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, config(1));
    let data = pseudo_random(BLOCK_SIZE as usize, 3);

    let mut plain_opts = FileOptions::default();
    plain_opts.dont_deduplicate = false;
    let mut no_dedup_opts = FileOptions::default();
    no_dedup_opts.dont_deduplicate = true;

    let f1 = proc.new_file(plain_opts);
    proc.append_to_file(f1, &data).unwrap();
    proc.finish_file(f1).unwrap();

    let f2 = proc.new_file(no_dedup_opts);
    proc.append_to_file(f2, &data).unwrap();
    proc.finish_file(f2).unwrap();

    let (report, _) = proc.finish().unwrap();
    assert_eq!(report.stats.blocks_written, 2);
    assert_eq!(report.stats.blocks_deduped, 0);
}

#[test]
fn trust_checksum_policy_also_dedups() {
    let mut cfg = config(1);
    cfg.dedup_policy = DedupPolicy::TrustChecksum;
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, cfg);
    let data = pseudo_random(BLOCK_SIZE as usize, 11);

    let f1 = proc.new_file(FileOptions::default());
    proc.append_to_file(f1, &data).unwrap();
    proc.finish_file(f1).unwrap();

    let f2 = proc.new_file(FileOptions::default());
    proc.append_to_file(f2, &data).unwrap();
    proc.finish_file(f2).unwrap();

    let (report, _) = proc.finish().unwrap();
    assert_eq!(report.stats.blocks_deduped, 1);
}

#[test]
fn empty_file_produces_no_blocks_and_no_fragment() {
    let mut proc = BlockProcessor::new(Cursor::new(Vec::new()), 0, config(1));
    let f = proc.new_file(FileOptions::default());
    proc.finish_file(f).unwrap();
    let (report, _) = proc.finish().unwrap();
    let fr = &report.files[&f];
    assert!(fr.block_size_words.is_empty());
    assert!(fr.fragment.is_none());
    assert_eq!(fr.total_size, 0);
}
