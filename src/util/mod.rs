//! String codecs shared by the store-facing layers.
//!
//! The URL encoders come in three variants because the store API treats the
//! path separator and query metacharacters differently; the wtf8 codec
//! rewrites invalid UTF-8 bytes into the U+E000 private plane so keys survive
//! the store's UTF-8 validation; the CR codec protects object names from the
//! XML parser's CR-to-LF normalization.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

const ENCODE_GENERAL_EXCEPT: &[u8] = b".-_~";
const ENCODE_PATH_EXCEPT: &[u8] = b".-_~/";
const ENCODE_QUERY_EXCEPT: &[u8] = b".-_~=&%";

// Start of the private plane used for escaping invalid bytes.
const WTF8_ESCAPE_BASE: u32 = 0xe000;

fn raw_url_encode(input: &str, except: &[u8]) -> String {
    let mut result = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        if byte.is_ascii_alphanumeric() || except.contains(&byte) {
            result.push(byte as char);
        } else {
            result.push('%');
            result.push_str(&format!("{byte:02X}"));
        }
    }
    result
}

pub fn url_encode_general(input: &str) -> String {
    raw_url_encode(input, ENCODE_GENERAL_EXCEPT)
}

/// URL encoding that keeps the path separator intact.
pub fn url_encode_path(input: &str) -> String {
    raw_url_encode(input, ENCODE_PATH_EXCEPT)
}

/// URL encoding for query strings, leaving '=', '&' and '%' alone so an
/// already-encoded value can pass through unchanged.
pub fn url_encode_query(input: &str) -> String {
    raw_url_encode(input, ENCODE_QUERY_EXCEPT)
}

fn hex_nibble(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'A'..=b'F' => byte - b'A' + 0x0a,
        b'a'..=b'f' => byte - b'a' + 0x0a,
        _ => 0,
    }
}

/// Tolerant percent-decoding; a truncated escape at the end of input is
/// dropped rather than rejected.
pub fn url_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] != b'%' {
            result.push(bytes[pos]);
            pos += 1;
            continue;
        }
        if pos + 2 >= bytes.len() {
            break;
        }
        result.push(hex_nibble(bytes[pos + 1]) * 16 + hex_nibble(bytes[pos + 2]));
        pos += 3;
    }
    result
}

pub fn base64_encode(input: &[u8]) -> String {
    BASE64.encode(input)
}

pub fn base64_decode(input: &str) -> crate::Result<Vec<u8>> {
    Ok(BASE64
        .decode(input)
        .map_err(|e| crate::Error::Store(format!("invalid base64: {e}")))?)
}

/// Length of the valid UTF-8 sequence starting at `bytes[0]`, or None when
/// the prefix is not well formed.
fn utf8_sequence_len(bytes: &[u8]) -> Option<usize> {
    let first = *bytes.first()?;
    if first <= 0x7f {
        return Some(1);
    }
    if !(0xc2..=0xf5).contains(&first) {
        return None;
    }
    let cont = |idx: usize| bytes.get(idx).is_some_and(|b| b & 0xc0 == 0x80);
    if first & 0xe0 == 0xc0 && cont(1) {
        return Some(2);
    }
    if first & 0xf0 == 0xe0 && cont(1) && cont(2) {
        let code = (u32::from(first & 0x0f) << 12)
            | (u32::from(bytes[1] & 0x3f) << 6)
            | u32::from(bytes[2] & 0x3f);
        if code >= 0x800 && !(0xd800..=0xdfff).contains(&code) {
            return Some(3);
        }
        return None;
    }
    if first & 0xf8 == 0xf0 && cont(1) && cont(2) && cont(3) {
        let code = (u32::from(first & 0x07) << 18)
            | (u32::from(bytes[1] & 0x3f) << 12)
            | (u32::from(bytes[2] & 0x3f) << 6)
            | u32::from(bytes[3] & 0x3f);
        if (0x10000..=0x10ffff).contains(&code) {
            return Some(4);
        }
    }
    None
}

/// Rewrite invalid UTF-8 bytes into three-byte encodings of the private
/// escape plane; valid sequences pass through unchanged.
pub fn wtf8_encode(input: &[u8]) -> String {
    let mut result = Vec::with_capacity(input.len());
    let mut pos = 0;
    while pos < input.len() {
        match utf8_sequence_len(&input[pos..]) {
            Some(len) => {
                result.extend_from_slice(&input[pos..pos + len]);
                pos += len;
            }
            None => {
                let escape = WTF8_ESCAPE_BASE + u32::from(input[pos]);
                result.push(0xe0 | ((escape >> 12) & 0x0f) as u8);
                result.push(0x80 | ((escape >> 6) & 0x3f) as u8);
                result.push(0x80 | (escape & 0x3f) as u8);
                pos += 1;
            }
        }
    }
    // Every byte written above is either part of a validated sequence or a
    // well-formed three-byte escape.
    String::from_utf8(result).expect("wtf8 escaping must produce valid utf-8")
}

/// Reverse of `wtf8_encode`: three-byte codepoints in the escape region turn
/// back into their original single bytes.
pub fn wtf8_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        let b = bytes[pos];
        if b & 0xf0 == 0xe0
            && pos + 2 < bytes.len()
            && bytes[pos + 1] & 0xc0 == 0x80
            && bytes[pos + 2] & 0xc0 == 0x80
        {
            let code = (u32::from(b & 0x0f) << 12)
                | (u32::from(bytes[pos + 1] & 0x3f) << 6)
                | u32::from(bytes[pos + 2] & 0x3f);
            if (WTF8_ESCAPE_BASE..=WTF8_ESCAPE_BASE + 0xff).contains(&code) {
                result.push((code - WTF8_ESCAPE_BASE) as u8);
                pos += 3;
                continue;
            }
        }
        result.push(b);
        pos += 1;
    }
    result
}

/// Encode '%' and CR so object names survive the XML parser's CR-to-LF
/// normalization; decode restores the original string.
pub fn cr_encode(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '%' => result.push_str("%45"),
            '\r' => result.push_str("%0D"),
            other => result.push(other),
        }
    }
    result
}

pub fn cr_decode(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(found) = rest.find('%') {
        result.push_str(&rest[..found]);
        let tail = &rest[found..];
        if tail.starts_with("%45") {
            result.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%0D") {
            result.push('\r');
            rest = &tail[3..];
        } else if tail.starts_with("%%") {
            result.push('%');
            rest = &tail[2..];
        } else {
            result.push('%');
            rest = &tail[1..];
        }
    }
    result.push_str(rest);
    result
}

/// Strip one layer of surrounding double quotes, as store etags arrive quoted.
pub fn peel_quotes(input: &str) -> &str {
    if input.len() >= 2 && input.starts_with('"') && input.ends_with('"') {
        &input[1..input.len() - 1]
    } else {
        input
    }
}
