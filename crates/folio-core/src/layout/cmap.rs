//! ToUnicode CMap parsing
//!
//! Fonts with custom encodings (subset TrueType, CID fonts) carry a
//! `ToUnicode` stream mapping character codes to Unicode text. Only the
//! `bfchar` and `bfrange` sections are needed for text extraction.

use std::collections::HashMap;

/// Mapping from character codes to Unicode strings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToUnicodeMap {
    map: HashMap<u32, String>,
    /// Bytes per character code (1 for simple fonts, 2 for CID fonts)
    code_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Hex(Vec<u8>),
    Keyword(String),
    ArrayStart,
    ArrayEnd,
}

impl ToUnicodeMap {
    /// Parse a decompressed CMap program
    pub fn parse(data: &[u8]) -> Self {
        let tokens = tokenize(data);
        let mut cmap = ToUnicodeMap {
            map: HashMap::new(),
            code_len: 0,
        };

        let mut i = 0;
        while i < tokens.len() {
            match &tokens[i] {
                Token::Keyword(k) if k == "begincodespacerange" => {
                    if let Some(Token::Hex(lo)) = tokens.get(i + 1) {
                        cmap.code_len = cmap.code_len.max(lo.len());
                    }
                    i += 1;
                }
                Token::Keyword(k) if k == "beginbfchar" => {
                    i += 1;
                    while i + 1 < tokens.len() {
                        match (&tokens[i], &tokens[i + 1]) {
                            (Token::Hex(src), Token::Hex(dst)) => {
                                cmap.note_code_len(src.len());
                                cmap.map.insert(code_value(src), utf16_be(dst));
                                i += 2;
                            }
                            _ => break,
                        }
                    }
                }
                Token::Keyword(k) if k == "beginbfrange" => {
                    i += 1;
                    i = cmap.parse_ranges(&tokens, i);
                }
                _ => i += 1,
            }
        }

        if cmap.code_len == 0 {
            cmap.code_len = 1;
        }
        cmap
    }

    fn note_code_len(&mut self, len: usize) {
        if self.code_len == 0 {
            self.code_len = len.clamp(1, 4);
        }
    }

    fn parse_ranges(&mut self, tokens: &[Token], mut i: usize) -> usize {
        while i + 2 < tokens.len() {
            let (lo, hi) = match (&tokens[i], &tokens[i + 1]) {
                (Token::Hex(lo), Token::Hex(hi)) => (lo, hi),
                _ => return i,
            };
            self.note_code_len(lo.len());
            let start = code_value(lo);
            let end = code_value(hi);
            if end < start || end - start > 0xFFFF {
                return i + 3;
            }
            match &tokens[i + 2] {
                Token::Hex(dst) => {
                    let base = utf16_be(dst);
                    let mut chars: Vec<char> = base.chars().collect();
                    for code in start..=end {
                        self.map.insert(code, chars.iter().collect());
                        // Ranges increment the last character of the destination
                        if let Some(last) = chars.last_mut() {
                            *last = char::from_u32(*last as u32 + 1).unwrap_or(*last);
                        }
                    }
                    i += 3;
                }
                Token::ArrayStart => {
                    let mut j = i + 3;
                    let mut code = start;
                    while j < tokens.len() {
                        match &tokens[j] {
                            Token::Hex(dst) => {
                                if code <= end {
                                    self.map.insert(code, utf16_be(dst));
                                }
                                code += 1;
                                j += 1;
                            }
                            Token::ArrayEnd => {
                                j += 1;
                                break;
                            }
                            _ => break,
                        }
                    }
                    i = j;
                }
                _ => return i,
            }
        }
        i
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Decode a byte string; unmapped codes are dropped
    pub fn decode(&self, bytes: &[u8]) -> String {
        let mut out = String::new();
        for chunk in bytes.chunks(self.code_len.max(1)) {
            if let Some(s) = self.map.get(&code_value(chunk)) {
                out.push_str(s);
            }
        }
        out
    }
}

fn code_value(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// Decode big-endian UTF-16 (surrogate pairs allowed)
pub fn utf16_be(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks(2)
        .map(|c| {
            if c.len() == 2 {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from(c[0])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

fn tokenize(data: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        match b {
            b'<' if data.get(i + 1) == Some(&b'<') => i += 2,
            b'>' if data.get(i + 1) == Some(&b'>') => i += 2,
            b'<' => {
                let start = i + 1;
                let mut end = start;
                while end < data.len() && data[end] != b'>' {
                    end += 1;
                }
                tokens.push(Token::Hex(parse_hex(&data[start..end])));
                i = end + 1;
            }
            b'[' => {
                tokens.push(Token::ArrayStart);
                i += 1;
            }
            b']' => {
                tokens.push(Token::ArrayEnd);
                i += 1;
            }
            b'%' => {
                while i < data.len() && data[i] != b'\n' && data[i] != b'\r' {
                    i += 1;
                }
            }
            b'(' => {
                // Literal strings only appear in the CMap header; skip them
                let mut depth = 0;
                while i < data.len() {
                    match data[i] {
                        b'\\' => i += 1,
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                i += 1;
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ if b.is_ascii_alphabetic() => {
                let start = i;
                while i < data.len() && data[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                tokens.push(Token::Keyword(
                    String::from_utf8_lossy(&data[start..i]).into_owned(),
                ));
            }
            _ => i += 1,
        }
    }
    tokens
}

fn parse_hex(digits: &[u8]) -> Vec<u8> {
    let clean: Vec<u8> = digits
        .iter()
        .copied()
        .filter(u8::is_ascii_hexdigit)
        .collect();
    clean
        .chunks(2)
        .map(|pair| {
            let hi = hex_val(pair[0]);
            let lo = pair.get(1).map_or(0, |c| hex_val(*c));
            (hi << 4) | lo
        })
        .collect()
}

fn hex_val(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"/CIDInit /ProcSet findresource begin
12 dict begin
begincmap
/CMapName /Adobe-Identity-UCS def
1 begincodespacerange
<0000> <FFFF>
endcodespacerange
2 beginbfchar
<0003> <0020>
<0011> <0048>
endbfchar
2 beginbfrange
<0020> <0022> <0061>
<0030> <0031> [<0058> <0059>]
endbfrange
endcmap";

    #[test]
    fn test_parse_bfchar_and_bfrange() {
        let cmap = ToUnicodeMap::parse(SAMPLE.as_bytes());
        assert_eq!(cmap.code_len(), 2);
        assert_eq!(cmap.decode(&[0x00, 0x11]), "H");
        assert_eq!(cmap.decode(&[0x00, 0x03]), " ");
        assert_eq!(cmap.decode(&[0x00, 0x20, 0x00, 0x21, 0x00, 0x22]), "abc");
        assert_eq!(cmap.decode(&[0x00, 0x30, 0x00, 0x31]), "XY");
    }

    #[test]
    fn test_unmapped_codes_dropped() {
        let cmap = ToUnicodeMap::parse(SAMPLE.as_bytes());
        assert_eq!(cmap.decode(&[0x01, 0x00]), "");
    }

    #[test]
    fn test_single_byte_cmap() {
        let data = b"1 begincodespacerange <00> <FF> endcodespacerange 1 beginbfchar <41> <00E9> endbfchar";
        let cmap = ToUnicodeMap::parse(data);
        assert_eq!(cmap.code_len(), 1);
        assert_eq!(cmap.decode(b"AA"), "\u{e9}\u{e9}");
    }

    #[test]
    fn test_utf16_surrogates() {
        assert_eq!(utf16_be(&[0xD8, 0x3D, 0xDE, 0x00]), "\u{1F600}");
    }
}
