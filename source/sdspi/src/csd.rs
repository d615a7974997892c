//! Decoding of the card-specific data (CSD) register.
//!
//! Only the fields needed to answer capacity queries are decoded. Byte `n` of
//! the array is the `n`th byte sent by the card, so bit 127 of the register is
//! the top bit of byte 0.

use crate::proto::CardType;

/// Returns the card's capacity in 512-byte sectors.
///
/// Returns `None` for field values that cannot describe a card.
#[must_use]
pub fn sector_count(csd: &[u8; 16]) -> Option<u32> {
    match csd[0] >> 6 {
        // CSD version 2.0: SDHC/SDXC.
        1 => {
            let c_size = u32::from(csd[9])
                | u32::from(csd[8]) << 8
                | u32::from(csd[7] & 0x3F) << 16;
            u32::try_from((u64::from(c_size) + 1) << 10).ok()
        }
        // CSD version 1.0 (SDSC), and the MMC layouts, which share the
        // capacity fields.
        _ => {
            let read_bl_len = csd[5] & 0x0F;
            let c_size_mult = (csd[10] & 0x80) >> 7 | (csd[9] & 0x03) << 1;
            let c_size = u32::from(csd[8] >> 6)
                | u32::from(csd[7]) << 2
                | u32::from(csd[6] & 0x03) << 10;
            let shift = (read_bl_len + c_size_mult + 2).checked_sub(9)?;
            Some((c_size + 1) << shift)
        }
    }
}

/// Returns the card's erase block size, in 512-byte sectors.
#[must_use]
pub fn erase_block_size(card_type: CardType, csd: &[u8; 16]) -> Option<u32> {
    if card_type.get(CardType::SD2) {
        // Version 2 cards report the allocation unit through the SD status
        // register instead; 64KiB is the smallest unit in use.
        return Some(128);
    }

    if card_type.get(CardType::SD1) {
        let sector_size = u32::from(csd[10] & 0x3F) << 1 | u32::from(csd[11] >> 7);
        let shift = (csd[13] >> 6).checked_sub(1)?;
        return Some((sector_size + 1) << shift);
    }

    if card_type.get(CardType::MMC) {
        let grp_size = u32::from((csd[10] & 0x7C) >> 2);
        let grp_mult = u32::from(csd[11] & 0x03) << 3 | u32::from(csd[11] >> 5);
        return Some((grp_size + 1) * (grp_mult + 1));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{csd_v1, csd_v2};
    use proptest::{prop_assert_eq, proptest};

    #[test]
    fn v2_sdhc() {
        // a "4GB" card
        assert_eq!(sector_count(&csd_v2(7579)), Some(7_761_920));
    }

    #[test]
    fn v2_overflow() {
        assert_eq!(sector_count(&csd_v2(0x3F_FFFF)), None);
    }

    #[test]
    fn v1_sdsc() {
        // 512-byte blocks, maximum C_SIZE and C_SIZE_MULT: 1GiB
        assert_eq!(sector_count(&csd_v1(9, 4095, 7)), Some(2_097_152));
        // 1024-byte blocks: twice as many sectors per block
        assert_eq!(sector_count(&csd_v1(10, 999, 3)), Some(1000 << 6));
    }

    #[test]
    fn v1_impossible_shift() {
        // READ_BL_LEN + C_SIZE_MULT + 2 < 9 cannot describe 512-byte sectors
        assert_eq!(sector_count(&csd_v1(4, 100, 0)), None);
    }

    #[test]
    fn mmc_structure() {
        // MMC v1.2 CSDs use structure 2 with the version 1.0 capacity fields
        let mut csd = csd_v1(9, 4095, 7);
        csd[0] = 0x80;
        assert_eq!(sector_count(&csd), Some(2_097_152));
    }

    #[test]
    fn erase_blocks() {
        let sd2 = CardType::new().with(CardType::SD2, true);
        assert_eq!(erase_block_size(sd2, &[0; 16]), Some(128));

        let sd1 = CardType::new().with(CardType::SD1, true);
        let mut csd = csd_v1(9, 4095, 7);
        // SECTOR_SIZE = 127, WRITE_BL_LEN = 0b1001
        csd[10] |= 0x3F;
        csd[11] |= 0x80;
        csd[12] |= 0x02;
        csd[13] |= 0x40;
        assert_eq!(erase_block_size(sd1, &csd), Some(128));

        csd[13] &= 0x3F;
        assert_eq!(erase_block_size(sd1, &csd), None);

        let mmc = CardType::new().with(CardType::MMC, true);
        let mut csd = csd_v1(9, 4095, 7);
        // ERASE_GRP_SIZE = 31, ERASE_GRP_MULT = 31
        csd[10] |= 0x7C;
        csd[11] |= 0xE3;
        assert_eq!(erase_block_size(mmc, &csd), Some(1024));

        assert_eq!(erase_block_size(CardType::NONE, &csd), None);
    }

    proptest! {
        #[test]
        fn v2_capacity(c_size in 0u32..0x3F_FFFF) {
            prop_assert_eq!(sector_count(&csd_v2(c_size)), Some((c_size + 1) << 10));
        }

        #[test]
        fn v1_capacity(read_bl_len in 9u8..=11, c_size in 0u16..4096, c_size_mult in 0u8..8) {
            let expected = (u32::from(c_size) + 1) << (read_bl_len + c_size_mult + 2 - 9);
            prop_assert_eq!(sector_count(&csd_v1(read_bl_len, c_size, c_size_mult)), Some(expected));
        }
    }
}
