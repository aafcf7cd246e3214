//! Reading and writing headerless SAM alignment records.
//!
//! Only the text form is handled here. The aligner is run with header
//! output suppressed, so every line is an alignment record with the 11
//! mandatory tab-separated columns, optionally followed by tags.

use std::io::{BufRead, Write};

use crate::error::{Error, Result};

/// Each segment of the template is properly aligned.
pub const FLAG_EACH_ALIGNED: u16 = 0x2;
/// The segment is unmapped.
pub const FLAG_UNMAPPED: u16 = 0x4;

/// A single SAM alignment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamRecord {
    pub qname: String,
    pub flag: u16,
    pub rname: String,
    /// 1-based leftmost mapping position.
    pub pos: usize,
    pub mapq: u8,
    pub cigar: String,
    pub rnext: String,
    pub pnext: usize,
    pub tlen: i64,
    pub seq: String,
    pub qual: String,
    /// Optional tags, kept verbatim as the tab-joined remainder of the line.
    pub tags: String,
}

impl SamRecord {
    /// Parses one headerless SAM line.
    pub fn parse(line: &str) -> Result<SamRecord> {
        let mut fields = line.splitn(12, '\t');
        let mut next = || {
            fields
                .next()
                .ok_or_else(|| Error::SamParse(line.to_string()))
        };
        let qname = next()?.to_string();
        let flag = parse_num::<u16>(next()?, line)?;
        let rname = next()?.to_string();
        let pos = parse_num::<usize>(next()?, line)?;
        let mapq = parse_num::<u8>(next()?, line)?;
        let cigar = next()?.to_string();
        let rnext = next()?.to_string();
        let pnext = parse_num::<usize>(next()?, line)?;
        let tlen = parse_num::<i64>(next()?, line)?;
        let seq = next()?.to_string();
        let qual = next()?.to_string();
        let tags = fields.next().unwrap_or("").to_string();
        Ok(SamRecord {
            qname,
            flag,
            rname,
            pos,
            mapq,
            cigar,
            rnext,
            pnext,
            tlen,
            seq,
            qual,
            tags,
        })
    }

    pub fn is_unmapped(&self) -> bool {
        self.flag & FLAG_UNMAPPED != 0
    }

    pub fn is_properly_aligned(&self) -> bool {
        self.flag & FLAG_EACH_ALIGNED != 0
    }

    /// The record as a SAM line, without a trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.qname,
            self.flag,
            self.rname,
            self.pos,
            self.mapq,
            self.cigar,
            self.rnext,
            self.pnext,
            self.tlen,
            self.seq,
            self.qual
        );
        if !self.tags.is_empty() {
            line.push('\t');
            line.push_str(&self.tags);
        }
        line
    }

    /// Re-emits the read as a 4-line fastq block.
    pub fn write_as_fastq<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(w, "@{}\n{}\n+\n{}", self.qname, self.seq, self.qual)?;
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, line: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| Error::SamParse(line.to_string()))
}

/// Iterates SAM records from any buffered reader.
///
/// Header lines (starting with `@`) and blank lines are skipped, so the
/// same reader works on spooled record streams and on full SAM files.
pub struct SamReader<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> SamReader<R> {
    pub fn new(reader: R) -> SamReader<R> {
        SamReader {
            reader,
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for SamReader<R> {
    type Item = Result<SamRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(Error::Io(e))),
            }
            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.is_empty() || line.starts_with('@') {
                continue;
            }
            return Some(SamRecord::parse(line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LINE: &str =
        "read1\t0\tspeciesA_ctg1\t1501\t42\t100M\t*\t0\t0\tACGT\tFFFF\tAS:i:-6\tNM:i:1";

    #[test]
    fn test_parse() {
        let r = SamRecord::parse(LINE).unwrap();
        assert_eq!(r.qname, "read1");
        assert_eq!(r.flag, 0);
        assert_eq!(r.rname, "speciesA_ctg1");
        assert_eq!(r.pos, 1501);
        assert_eq!(r.mapq, 42);
        assert_eq!(r.cigar, "100M");
        assert_eq!(r.seq, "ACGT");
        assert_eq!(r.qual, "FFFF");
        assert_eq!(r.tags, "AS:i:-6\tNM:i:1");
        assert!(!r.is_unmapped());
    }

    #[test]
    fn test_parse_roundtrip() {
        let r = SamRecord::parse(LINE).unwrap();
        assert_eq!(r.to_line(), LINE);

        // without tags
        let short = "r\t4\t*\t0\t0\t*\t*\t0\t0\tAC\tFF";
        let r = SamRecord::parse(short).unwrap();
        assert!(r.tags.is_empty());
        assert_eq!(r.to_line(), short);
    }

    #[test]
    fn test_parse_errors() {
        assert!(SamRecord::parse("only\tthree\tfields").is_err());
        let bad_mapq = "r\t0\tc\t10\tmany\t*\t*\t0\t0\tAC\tFF";
        assert!(SamRecord::parse(bad_mapq).is_err());
    }

    #[test]
    fn test_flags() {
        let mut r = SamRecord::parse(LINE).unwrap();
        r.flag = FLAG_UNMAPPED;
        assert!(r.is_unmapped());
        assert!(!r.is_properly_aligned());
        r.flag = FLAG_EACH_ALIGNED | 0x40;
        assert!(r.is_properly_aligned());
        assert!(!r.is_unmapped());
    }

    #[test]
    fn test_reader_skips_headers() {
        let text = format!("@HD\tVN:1.6\n@SQ\tSN:c\tLN:100\n{LINE}\n\n{LINE}\n");
        let records: Vec<_> = SamReader::new(Cursor::new(text))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], records[1]);
        assert_eq!(records[0].qname, "read1");
    }

    #[test]
    fn test_write_as_fastq() {
        let r = SamRecord::parse(LINE).unwrap();
        let mut out = Vec::new();
        r.write_as_fastq(&mut out).unwrap();
        assert_eq!(out, b"@read1\nACGT\n+\nFFFF\n");
    }
}
