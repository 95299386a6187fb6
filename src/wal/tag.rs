//! Row tags
//!
//! A tag is 16 bits: the low 14 bits are the type code, the two high bits
//! the category (snapshot, WAL or system). Type codes are unique regardless
//! of category.

/// Mask selecting the type code
pub const TAG_MASK: u16 = 0x3fff;
/// Number of bits used by the type code
pub const TAG_SIZE: u32 = 14;
/// Snapshot category
pub const TAG_SNAP: u16 = 0x4000;
/// WAL category
pub const TAG_WAL: u16 = 0x8000;
/// System category
pub const TAG_SYS: u16 = 0xc000;

pub const SNAP_INITIAL: u16 = 1;
pub const SNAP_DATA: u16 = 2;
pub const WAL_DATA: u16 = 3;
pub const SNAP_FINAL: u16 = 4;
pub const WAL_FINAL: u16 = 5;
pub const RUN_CRC: u16 = 6;
pub const NOP: u16 = 7;
pub const SNAP_SKIP_SCN: u16 = 8;
pub const PAXOS_PREPARE: u16 = 9;
pub const PAXOS_PROMISE: u16 = 10;
pub const PAXOS_PROPOSE: u16 = 11;
pub const PAXOS_ACCEPT: u16 = 12;
pub const PAXOS_NOP: u16 = 13;
/// First type code available to applications
pub const USER_TAG: u16 = 32;

/// Category encoded in the two high bits of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagCategory {
    Invalid,
    Snap,
    Wal,
    Sys,
}

/// Category of a full tag
pub fn category(tag: u16) -> TagCategory {
    match tag & !TAG_MASK {
        TAG_SNAP => TagCategory::Snap,
        TAG_WAL => TagCategory::Wal,
        TAG_SYS => TagCategory::Sys,
        _ => TagCategory::Invalid,
    }
}

/// Type code of a full tag
pub fn type_code(tag: u16) -> u16 {
    tag & TAG_MASK
}

/// True when applying a row with this tag advances the SCN
pub fn scn_changer(tag: u16) -> bool {
    let code = tag & TAG_MASK;
    category(tag) == TagCategory::Wal || code == NOP || code == RUN_CRC
}

/// Placeholder rows carry no payload for the executor
pub fn dummy_tag(tag: u16) -> bool {
    tag & TAG_MASK == WAL_FINAL
}

/// True for rows whose payload belongs to the executor
pub fn carries_data(tag: u16) -> bool {
    if dummy_tag(tag) {
        return false;
    }
    let code = tag & TAG_MASK;
    match category(tag) {
        TagCategory::Snap => code == SNAP_DATA || code >= USER_TAG,
        TagCategory::Wal => code == WAL_DATA || code >= USER_TAG,
        _ => false,
    }
}

/// Add the category bits to a tag written by a format that lacked them
pub fn fix_tag_v2(tag: u16) -> u16 {
    if tag & !TAG_MASK != 0 {
        return tag;
    }
    match tag {
        SNAP_INITIAL | SNAP_DATA | SNAP_FINAL | SNAP_SKIP_SCN => tag | TAG_SNAP,
        WAL_DATA | WAL_FINAL => tag | TAG_WAL,
        RUN_CRC | NOP => tag | TAG_SYS,
        PAXOS_PREPARE..=PAXOS_NOP => tag | TAG_SYS,
        _ => tag | TAG_WAL,
    }
}

/// Render a tag for logs and the `cat` tool
pub fn tag_to_str(tag: u16) -> String {
    let code = tag & TAG_MASK;
    let name = match code {
        SNAP_INITIAL => "snap_initial",
        SNAP_DATA => "snap_data",
        WAL_DATA => "wal_data",
        SNAP_FINAL => "snap_final",
        WAL_FINAL => "wal_final",
        RUN_CRC => "run_crc",
        NOP => "nop",
        SNAP_SKIP_SCN => "snap_skip_scn",
        PAXOS_PREPARE => "paxos_prepare",
        PAXOS_PROMISE => "paxos_promise",
        PAXOS_PROPOSE => "paxos_propose",
        PAXOS_ACCEPT => "paxos_accept",
        PAXOS_NOP => "paxos_nop",
        _ => "",
    };
    let prefix = match category(tag) {
        TagCategory::Snap => "snap",
        TagCategory::Wal => "wal",
        TagCategory::Sys => "sys",
        TagCategory::Invalid => "invalid",
    };
    if name.is_empty() {
        format!("{}/usr{}", prefix, code)
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scn_changers() {
        assert!(scn_changer(WAL_DATA | TAG_WAL));
        assert!(scn_changer(USER_TAG | TAG_WAL));
        assert!(scn_changer(NOP | TAG_SYS));
        assert!(scn_changer(RUN_CRC | TAG_SYS));
        assert!(!scn_changer(SNAP_DATA | TAG_SNAP));
        assert!(!scn_changer(SNAP_FINAL | TAG_SYS));
    }

    #[test]
    fn test_dummy_and_data() {
        assert!(dummy_tag(WAL_FINAL | TAG_WAL));
        assert!(!carries_data(WAL_FINAL | TAG_WAL));
        assert!(carries_data(WAL_DATA | TAG_WAL));
        assert!(carries_data(SNAP_DATA | TAG_SNAP));
        assert!(carries_data((USER_TAG + 3) | TAG_WAL));
        assert!(!carries_data(SNAP_INITIAL | TAG_SNAP));
        assert!(!carries_data(RUN_CRC | TAG_SYS));
    }

    #[test]
    fn test_fix_tag_v2() {
        assert_eq!(fix_tag_v2(SNAP_DATA), SNAP_DATA | TAG_SNAP);
        assert_eq!(fix_tag_v2(WAL_DATA), WAL_DATA | TAG_WAL);
        assert_eq!(fix_tag_v2(NOP), NOP | TAG_SYS);
        assert_eq!(fix_tag_v2(USER_TAG + 1), (USER_TAG + 1) | TAG_WAL);
        assert_eq!(fix_tag_v2(WAL_DATA | TAG_WAL), WAL_DATA | TAG_WAL);
    }

    #[test]
    fn test_tag_names() {
        assert_eq!(tag_to_str(WAL_DATA | TAG_WAL), "wal/wal_data");
        assert_eq!(tag_to_str((USER_TAG + 2) | TAG_WAL), "wal/usr34");
        assert_eq!(tag_to_str(RUN_CRC | TAG_SYS), "sys/run_crc");
    }
}
