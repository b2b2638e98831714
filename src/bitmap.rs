//! Power-of-two region allocator over a word bitmap.
//!
//! A bitmap is a slice of `u32` words; bit `n` lives in word `n / 32` at
//! offset `n % 32`. A region is `2^order` contiguous bits starting at any
//! position, so one region may touch several words. Nothing here knows about
//! inodes or blocks; the ext2 driver feeds its bitmap blocks through
//! [`words_from_bytes`] and writes them back with [`bytes_from_words`].

use alloc::vec::Vec;
use core::cmp::min;

use crate::error::RegionError;

/// Width of one bitmap word.
pub const BITS_PER_WORD: u32 = u32::BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionOp {
    /// check for contiguous zero bits
    IsFree,
    /// set the bits
    Alloc,
    /// clear the bits
    Release,
}

/// Number of words needed to hold `num_bits` bits.
pub fn words_for(num_bits: u32) -> usize {
    ((num_bits as u64 + BITS_PER_WORD as u64 - 1) / BITS_PER_WORD as u64) as usize
}

fn last_word_mask(num_bits: u32) -> u32 {
    match num_bits % BITS_PER_WORD {
        0 => u32::MAX,
        rem => (1u32 << rem) - 1,
    }
}

/// Yields `(word index, mask)` pairs covering bits `[pos, pos + 2^order)`.
fn region_masks(pos: u32, order: u32) -> impl Iterator<Item = (usize, u32)> {
    let end = pos as u64 + (1u64 << order);
    let mut bit = pos as u64;
    core::iter::from_fn(move || {
        if bit >= end {
            return None;
        }
        let word = (bit / BITS_PER_WORD as u64) as usize;
        let offset = (bit % BITS_PER_WORD as u64) as u32;
        let span = min((BITS_PER_WORD - offset) as u64, end - bit) as u32;
        let mask = if span == BITS_PER_WORD {
            u32::MAX
        } else {
            ((1u32 << span) - 1) << offset
        };
        bit += span as u64;
        Some((word, mask))
    })
}

fn region_in_bounds(bitmap: &[u32], pos: u32, order: u32) -> bool {
    order < 32 && pos as u64 + (1u64 << order) <= bitmap.len() as u64 * BITS_PER_WORD as u64
}

fn reg_op(bitmap: &mut [u32], pos: u32, order: u32, op: RegionOp) -> bool {
    if !region_in_bounds(bitmap, pos, order) {
        return false;
    }
    match op {
        RegionOp::IsFree => region_masks(pos, order).all(|(i, mask)| bitmap[i] & mask == 0),
        RegionOp::Alloc => {
            region_masks(pos, order).for_each(|(i, mask)| bitmap[i] |= mask);
            true
        }
        RegionOp::Release => {
            region_masks(pos, order).for_each(|(i, mask)| bitmap[i] &= !mask);
            true
        }
    }
}

/// Returns true if every bit of the region is clear.
pub fn test_region(bitmap: &[u32], pos: u32, order: u32) -> bool {
    region_in_bounds(bitmap, pos, order)
        && region_masks(pos, order).all(|(i, mask)| bitmap[i] & mask == 0)
}

fn region_fully_set(bitmap: &[u32], pos: u32, order: u32) -> bool {
    region_in_bounds(bitmap, pos, order)
        && region_masks(pos, order).all(|(i, mask)| bitmap[i] & mask == mask)
}

/// Finds a free region of `2^order` bits and marks it allocated.
///
/// Candidates start at `0, 2^order, 2 * 2^order, ...` and must fit inside
/// `num_bits`. This is first-fit over fixed strides: a free run that does
/// not begin on a stride boundary is never considered, so the call can fail
/// while enough fragmented free bits exist.
pub fn find_free_region(bitmap: &mut [u32], num_bits: u32, order: u32) -> Result<u32, RegionError> {
    if order >= 32 {
        return Err(RegionError::OutOfSpace);
    }
    let limit = min(num_bits as u64, bitmap.len() as u64 * BITS_PER_WORD as u64);
    let stride = 1u64 << order;
    let mut pos = 0u64;
    while pos + stride <= limit {
        if reg_op(bitmap, pos as u32, order, RegionOp::IsFree) {
            reg_op(bitmap, pos as u32, order, RegionOp::Alloc);
            return Ok(pos as u32);
        }
        pos += stride;
    }
    Err(RegionError::OutOfSpace)
}

/// Claims a specific region. Fails without side effects if any bit is set.
pub fn allocate_region(bitmap: &mut [u32], pos: u32, order: u32) -> Result<(), RegionError> {
    if !reg_op(bitmap, pos, order, RegionOp::IsFree) {
        return Err(RegionError::Busy);
    }
    reg_op(bitmap, pos, order, RegionOp::Alloc);
    Ok(())
}

/// Clears a region unconditionally.
pub fn release_region(bitmap: &mut [u32], pos: u32, order: u32) {
    debug_assert!(
        region_fully_set(bitmap, pos, order),
        "releasing region {}/{} that was not fully allocated",
        pos,
        order
    );
    reg_op(bitmap, pos, order, RegionOp::Release);
}

pub fn set_bit(bitmap: &mut [u32], bit: u32) {
    bitmap[(bit / BITS_PER_WORD) as usize] |= 1 << (bit % BITS_PER_WORD);
}

pub fn clear_bit(bitmap: &mut [u32], bit: u32) {
    bitmap[(bit / BITS_PER_WORD) as usize] &= !(1 << (bit % BITS_PER_WORD));
}

pub fn test_bit(bitmap: &[u32], bit: u32) -> bool {
    bitmap
        .get((bit / BITS_PER_WORD) as usize)
        .map_or(false, |w| w & (1 << (bit % BITS_PER_WORD)) != 0)
}

/// Sets the first `num_bits` bits. Bits past `num_bits` are untouched.
pub fn bitmap_set(bitmap: &mut [u32], num_bits: u32) {
    let words = words_for(num_bits);
    if words == 0 {
        return;
    }
    bitmap[..words - 1].fill(u32::MAX);
    bitmap[words - 1] |= last_word_mask(num_bits);
}

/// Clears the first `num_bits` bits. Bits past `num_bits` are untouched.
pub fn bitmap_clear(bitmap: &mut [u32], num_bits: u32) {
    let words = words_for(num_bits);
    if words == 0 {
        return;
    }
    bitmap[..words - 1].fill(0);
    bitmap[words - 1] &= !last_word_mask(num_bits);
}

/// Copies the first `num_bits` bits of `src` into `dest`.
pub fn bitmap_copy(dest: &mut [u32], src: &[u32], num_bits: u32) {
    let words = words_for(num_bits);
    if words == 0 {
        return;
    }
    dest[..words - 1].copy_from_slice(&src[..words - 1]);
    let mask = last_word_mask(num_bits);
    dest[words - 1] = (dest[words - 1] & !mask) | (src[words - 1] & mask);
}

pub fn bitmap_empty(bitmap: &[u32], num_bits: u32) -> bool {
    let words = words_for(num_bits);
    if words == 0 {
        return true;
    }
    bitmap[..words - 1].iter().all(|&w| w == 0) && bitmap[words - 1] & last_word_mask(num_bits) == 0
}

pub fn bitmap_full(bitmap: &[u32], num_bits: u32) -> bool {
    let words = words_for(num_bits);
    if words == 0 {
        return true;
    }
    let mask = last_word_mask(num_bits);
    bitmap[..words - 1].iter().all(|&w| w == u32::MAX) && bitmap[words - 1] & mask == mask
}

pub fn bitmap_equal(first: &[u32], second: &[u32], num_bits: u32) -> bool {
    let words = words_for(num_bits);
    if words == 0 {
        return true;
    }
    first[..words - 1] == second[..words - 1]
        && (first[words - 1] ^ second[words - 1]) & last_word_mask(num_bits) == 0
}

/// Number of set bits among the first `num_bits`.
pub fn bitmap_weight(bitmap: &[u32], num_bits: u32) -> u32 {
    let words = words_for(num_bits);
    if words == 0 {
        return 0;
    }
    let full: u32 = bitmap[..words - 1].iter().map(|w| w.count_ones()).sum();
    full + (bitmap[words - 1] & last_word_mask(num_bits)).count_ones()
}

/// Reinterprets a little-endian byte bitmap as words.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|c| {
            let mut word = [0u8; 4];
            word[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(word)
        })
        .collect()
}

/// Writes words back into a little-endian byte bitmap.
pub fn bytes_from_words(words: &[u32], bytes: &mut [u8]) {
    for (chunk, word) in bytes.chunks_mut(4).zip(words) {
        let le = word.to_le_bytes();
        chunk.copy_from_slice(&le[..chunk.len()]);
    }
}
