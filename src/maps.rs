use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use bitflags::bitflags;

use crate::address::{decode_address, DecodedAddress};
use crate::error::{Error, Result};

/// The grouping key used for regions that are not backed by any file.
pub const ANONYMOUS_KEY: &str = "anonymous";

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PagePermissions
//
///////////////////////////////////////////////////////////////////////////////////////////////////

bitflags! {
    /// The permissions that the pages of a region may have.
    #[derive(Default)]
    pub struct PagePermissions: u8 {
        /// Permission to be read.
        const READ    = 1 << 0;
        /// Permission to be written.
        const WRITE   = 1 << 1;
        /// Permission to be executed.
        const EXECUTE = 1 << 2;
        /// A page can be `shared` or `private` (i.e., copy-on-write).
        const SHARED  = 1 << 3;
    }
}

impl std::str::FromStr for PagePermissions {
    type Err = Error;

    /// Parses the four-character permission field of a maps line. Each position only accepts
    /// its own flag or `-`, except for the last one, which is either `s` or `p`.
    fn from_str(s: &str) -> Result<Self> {
        const FLAGS: [(char, PagePermissions); 4] = [
            ('r', PagePermissions::READ),
            ('w', PagePermissions::WRITE),
            ('x', PagePermissions::EXECUTE),
            ('s', PagePermissions::SHARED),
        ];

        if s.chars().count() != 4 {
            return Err(Error::ParsePagePermissions(s.into()));
        }
        let mut ret: PagePermissions = Default::default();
        for (c, (flag_char, flag)) in s.chars().zip(FLAGS.iter()) {
            ret |= match c {
                c if c == *flag_char => *flag,
                '-' if *flag_char != 's' => Self::empty(),
                'p' if *flag_char == 's' => Self::empty(),
                _ => return Err(Error::ParsePagePermissions(s.into())),
            }
        }
        Ok(ret)
    }
}

impl fmt::Display for PagePermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ret = "---p".to_owned();
        if self.contains(Self::READ) {
            ret.replace_range(0..1, "r");
        }
        if self.contains(Self::WRITE) {
            ret.replace_range(1..2, "w");
        }
        if self.contains(Self::EXECUTE) {
            ret.replace_range(2..3, "x");
        }
        if self.contains(Self::SHARED) {
            ret.replace_range(3..4, "s");
        }
        write!(f, "{}", ret)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// DeviceNumbers
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Major and minor numbers of the file backing a region.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumbers {
    major: u32,
    minor: u32,
}

impl DeviceNumbers {
    /// Retrieve the major number.
    #[inline(always)]
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Retrieve the minor number.
    #[inline(always)]
    pub fn minor(&self) -> u32 {
        self.minor
    }
}

impl std::str::FromStr for DeviceNumbers {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s
            .split_once(':')
            .ok_or_else(|| Error::MalformedMapLine(s.into()))?;
        let parse =
            |n: &str| u32::from_str_radix(n, 16).map_err(|_| Error::MalformedMapLine(s.into()));
        Ok(DeviceNumbers {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

impl fmt::Display for DeviceNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}", self.major, self.minor)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Backing
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The object a region is mapped from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Backing {
    /// A file path or a bracketed pseudo-path (`[heap]`, `[stack]`, ...), kept verbatim.
    Path(String),
    /// No backing object at all.
    Anonymous,
}

impl Backing {
    /// The key under which regions with this backing object are grouped.
    pub fn key(&self) -> &str {
        match self {
            Backing::Path(p) => p,
            Backing::Anonymous => ANONYMOUS_KEY,
        }
    }

    /// Returns `true` if there is no backing object.
    #[inline(always)]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Backing::Anonymous)
    }
}

impl fmt::Display for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MemoryRegion
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The size of a region, as far as it can be told from its decoded bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    /// Both bounds decoded and `end >= start`.
    Known(u64),
    /// A bound overflowed, or the bounds are reversed.
    Indeterminate,
}

impl Span {
    /// Returns the size in bytes, if known.
    #[inline(always)]
    pub fn bytes(&self) -> Option<u64> {
        match *self {
            Span::Known(n) => Some(n),
            Span::Indeterminate => None,
        }
    }
}

/// A region of virtual memory, as decoded from a single line of `/proc/<PID>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub(crate) start: DecodedAddress,
    pub(crate) end: DecodedAddress,
    pub(crate) perms: PagePermissions,
    pub(crate) offset: Option<u64>,
    pub(crate) dev: Option<DeviceNumbers>,
    pub(crate) inode: Option<u64>,
    pub(crate) backing: Backing,
}

impl MemoryRegion {
    /// Returns the first address included in the region.
    #[inline(always)]
    pub fn start(&self) -> DecodedAddress {
        self.start
    }

    /// Returns the address right after the last one included in the region.
    #[inline(always)]
    pub fn end(&self) -> DecodedAddress {
        self.end
    }

    /// Retrieve the permissions for the pages of the region.
    #[inline(always)]
    pub fn permissions(&self) -> PagePermissions {
        self.perms
    }

    /// Returns `true` if the pages of the region may be read.
    #[inline(always)]
    pub fn readable(&self) -> bool {
        self.perms.contains(PagePermissions::READ)
    }

    /// Retrieve the offset in the backing file where the mapping begins, if it was listed.
    #[inline(always)]
    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Retrieve the major and minor numbers of the backing file, if they were listed.
    #[inline(always)]
    pub fn device_numbers(&self) -> Option<DeviceNumbers> {
        self.dev
    }

    /// Retrieve the inode of the backing file, if it was listed.
    #[inline(always)]
    pub fn inode(&self) -> Option<u64> {
        self.inode
    }

    /// Retrieve the object that the region is mapped from.
    #[inline(always)]
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// The key this region is accounted under: its path verbatim, or [`ANONYMOUS_KEY`].
    #[inline(always)]
    pub fn key(&self) -> &str {
        self.backing.key()
    }

    /// Returns the size of the region in bytes, unless a bound overflowed or the bounds are
    /// reversed.
    pub fn span(&self) -> Span {
        match (self.start, self.end) {
            (DecodedAddress::Value(s), DecodedAddress::Value(e)) if e >= s => {
                Span::Known((e - s) as u64)
            }
            _ => Span::Indeterminate,
        }
    }

    /// Returns `end - start` computed on the raw bounds, overflow sentinels included.
    ///
    /// This is what the region size looks like if [`DecodedAddress::Overflow`] is not checked
    /// for; use [`Self::span`] for accounting.
    #[inline(always)]
    pub fn raw_size(&self) -> i64 {
        self.end.raw().wrapping_sub(self.start.raw())
    }
}

impl std::str::FromStr for MemoryRegion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_map_line(s)
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span() {
            Span::Known(size) => write!(
                f,
                "{}-{} ({:8}K) {} {}",
                self.start,
                self.end,
                size / 1024,
                self.perms,
                self.backing
            ),
            Span::Indeterminate => write!(
                f,
                "{}-{} ({:>9}) {} {}",
                self.start, self.end, "?", self.perms, self.backing
            ),
        }
    }
}

/// Parse a single line of `/proc/<PID>/maps` into a [`MemoryRegion`].
///
/// Only the address range and permissions are mandatory. The sixth field, when present, is the
/// backing path and is used verbatim; otherwise the region is anonymous. Offset, device and
/// inode are kept only when they are present and well-formed.
///
/// # Errors
///
/// - [`Error::MalformedAddressRange`] if the first field is not exactly two `-`-separated tokens;
/// - [`Error::ParseAddress`] if either token is not hexadecimal;
/// - [`Error::MalformedMapLine`] if the permissions field is missing;
/// - [`Error::ParsePagePermissions`] if the permissions field is invalid.
pub fn parse_map_line(line: &str) -> Result<MemoryRegion> {
    let fields: Vec<_> = line.split_ascii_whitespace().collect();
    let range = fields
        .first()
        .ok_or_else(|| Error::MalformedMapLine(line.into()))?;
    let bounds: Vec<_> = range.split('-').collect();
    if bounds.len() != 2 {
        return Err(Error::MalformedAddressRange((*range).into()));
    }
    let perms = fields
        .get(1)
        .ok_or_else(|| Error::MalformedMapLine(line.into()))?;

    Ok(MemoryRegion {
        start: decode_address(bounds[0])?,
        end: decode_address(bounds[1])?,
        perms: perms.parse()?,
        offset: fields.get(2).and_then(|o| u64::from_str_radix(o, 16).ok()),
        dev: fields.get(3).and_then(|d| d.parse().ok()),
        inode: fields.get(4).and_then(|i| i.parse().ok()),
        backing: fields
            .get(5)
            .map_or(Backing::Anonymous, |&p| Backing::Path(p.to_owned())),
    })
}

/// Parse the whole contents of a `/proc/<PID>/maps` file, skipping blank lines.
pub fn parse_maps(contents: &str) -> Result<Vec<MemoryRegion>> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_map_line)
        .collect()
}

/// Read the lines of a map listing in one pass.
///
/// Backing paths are arbitrary bytes; any byte sequence that is not valid UTF-8 is replaced with
/// `U+FFFD` rather than failing the read.
pub fn read_map_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref().display().to_string();
    let f = File::open(&path).map_err(|e| Error::Open {
        path: path.clone(),
        source: e,
    })?;
    BufReader::with_capacity(1 << 14, f)
        .split(b'\n')
        .map(|line| {
            line.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .map_err(|e| Error::Read {
                    path: path.clone(),
                    source: e,
                })
        })
        .collect()
}

/// Read and parse a map listing, e.g. `/proc/<PID>/maps`.
pub fn read_maps<P: AsRef<Path>>(path: P) -> Result<Vec<MemoryRegion>> {
    read_map_lines(path)?
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_map_line(line))
        .collect()
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_perms() {
        let perms = vec![
            "---s", "---p", "r--s", "r--p", "rw-s", "-w-s", "-w-p", "--xs", "--xp", "rw-p", "r-xp",
        ];
        for p in perms {
            let pp = p.parse::<PagePermissions>().unwrap();
            assert_eq!(format!("{}", pp), p);
        }
    }

    #[test]
    fn test_invalid_perms() {
        for p in &["", "r", "rw-", "rw-pp", "wr-p", "rwx-", "r?xp", "rwxs "] {
            assert!(p.parse::<PagePermissions>().is_err(), "{:?}", p);
        }
    }

    #[test]
    fn test_file_backed_line() -> anyhow::Result<()> {
        let r = parse_map_line("00400000-00401000 r-xp 00000000 08:01 123 /bin/cat")?;
        assert_eq!(r.start(), DecodedAddress::Value(0x40_0000));
        assert_eq!(r.end(), DecodedAddress::Value(0x40_1000));
        assert!(r.readable());
        assert_eq!(r.key(), "/bin/cat");
        assert_eq!(r.span(), Span::Known(4096));
        assert_eq!(r.offset(), Some(0));
        assert_eq!(r.inode(), Some(123));
        let dev = r.device_numbers().unwrap();
        assert_eq!((dev.major(), dev.minor()), (8, 1));
        Ok(())
    }

    #[test]
    fn test_anonymous_line() -> anyhow::Result<()> {
        let r = parse_map_line("00600000-00601000 rw-p 00000000 00:00 0 ")?;
        assert!(r.backing().is_anonymous());
        assert_eq!(r.key(), ANONYMOUS_KEY);
        assert_eq!(r.span().bytes(), Some(4096));
        Ok(())
    }

    #[test]
    fn test_unreadable_line() -> anyhow::Result<()> {
        let r = parse_map_line("7f0000000000-7f0000001000 ---p 00000000 00:00 0")?;
        assert!(!r.readable());
        assert_eq!(r.permissions(), PagePermissions::empty());
        Ok(())
    }

    #[test]
    fn test_pseudo_paths_kept_verbatim() -> anyhow::Result<()> {
        let lines = [
            ("7ffcec729000-7ffcec784000 rw-p 00000000 00:00 0                          [stack]", "[stack]"),
            ("7ffcec7d1000-7ffcec7d3000 r-xp 00000000 00:00 0                          [vdso]", "[vdso]"),
            ("7f368bc85000-7f368bca7000 r--s 00000000 fe:00 400910                     /usr/share/zsh/functions/Completion/Base.zwc", "/usr/share/zsh/functions/Completion/Base.zwc"),
            ("7f368bc85000-7f368bca7000 rw-s 00000000 00:05 1234 /memfd:buf (deleted)", "/memfd:buf"),
        ];
        for (line, key) in lines.iter() {
            assert_eq!(parse_map_line(line)?.key(), *key);
        }
        Ok(())
    }

    #[test]
    fn test_overflowing_bound() -> anyhow::Result<()> {
        let r = parse_map_line("ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0  [vsyscall]")?;
        assert!(r.start().is_overflow());
        assert!(r.end().is_overflow());
        assert_eq!(r.span(), Span::Indeterminate);
        assert_eq!(r.raw_size(), 0);

        let r = parse_map_line("7ffffffff000-8000000000000000 r--p 00000000 00:00 0")?;
        assert_eq!(r.start().raw(), 0x7fff_ffff_f000);
        assert_eq!(r.end().raw(), -1);
        assert_eq!(r.span(), Span::Indeterminate);
        assert_eq!(r.raw_size(), -1 - 0x7fff_ffff_f000);
        Ok(())
    }

    #[test]
    fn test_reversed_bounds_are_indeterminate() -> anyhow::Result<()> {
        let r = parse_map_line("00002000-00001000 r--p 00000000 00:00 0")?;
        assert_eq!(r.span(), Span::Indeterminate);
        Ok(())
    }

    #[test]
    fn test_malformed_address_range() {
        for line in &[
            "00400000 r-xp 00000000 08:01 123 /bin/cat",
            "00400000-00401000-00402000 r-xp 00000000 08:01 123 /bin/cat",
        ] {
            assert!(matches!(
                parse_map_line(line),
                Err(Error::MalformedAddressRange(_))
            ));
        }
        assert!(matches!(
            parse_map_line("0040zz00-00401000 r-xp"),
            Err(Error::ParseAddress { .. })
        ));
        assert!(matches!(
            parse_map_line("00400000-00401000"),
            Err(Error::MalformedMapLine(_))
        ));
        assert!(matches!(
            parse_map_line(""),
            Err(Error::MalformedMapLine(_))
        ));
    }

    #[test]
    fn test_parse_maps() -> anyhow::Result<()> {
        let maps = "00400000-00401000 r-xp 00000000 08:01 123 /bin/cat\n\
                    \n\
                    00600000-00601000 rw-p 00000000 00:00 0\n";
        let regions = parse_maps(maps)?;
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].key(), ANONYMOUS_KEY);
        Ok(())
    }

    #[test]
    fn test_read_maps() -> anyhow::Result<()> {
        use std::io::Write;

        let mut f = tempfile::NamedTempFile::new()?;
        writeln!(f, "00400000-00401000 r-xp 00000000 08:01 123 /bin/cat")?;
        writeln!(f, "7f0000000000-7f0000001000 ---p 00000000 00:00 0")?;
        f.flush()?;
        assert_eq!(read_map_lines(f.path())?.len(), 2);
        let regions = read_maps(f.path())?;
        assert_eq!(regions.len(), 2);
        assert!(regions[0].readable());
        assert!(!regions[1].readable());
        assert!(matches!(
            read_maps("/nonexistent/procmem/maps"),
            Err(Error::Open { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_read_maps_with_non_utf8_path() -> anyhow::Result<()> {
        use std::io::Write;

        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(b"00400000-00401000 r-xp 00000000 08:01 123 /tmp/caf\xe9.so\n")?;
        f.write_all(b"00600000-00601000 rw-p 00000000 00:00 0\n")?;
        f.flush()?;
        let regions = read_maps(f.path())?;
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].key(), "/tmp/caf\u{fffd}.so");
        assert_eq!(regions[0].span(), Span::Known(4096));
        assert_eq!(regions[1].key(), ANONYMOUS_KEY);
        Ok(())
    }

    #[test]
    fn test_display() -> anyhow::Result<()> {
        let r = parse_map_line("00400000-00401000 r-xp 00000000 08:01 123 /bin/cat")?;
        assert_eq!(
            format!("{}", r),
            "0x0000000000400000-0x0000000000401000 (       4K) r-xp /bin/cat"
        );
        Ok(())
    }
}
