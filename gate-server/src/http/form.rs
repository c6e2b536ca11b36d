//! 表单体解析
//!
//! `application/x-www-form-urlencoded` 的键值拆分与百分号解码。

use std::collections::HashMap;

/// 解析表单体为键值映射
pub fn parse(body: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in body.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            params.insert(percent_decode(key), percent_decode(value));
        }
    }
    params
}

/// 百分号解码，`+` 解码为空格；非法转义序列原样保留
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_with_decoding() {
        let params = parse("username=alice&password=p%40ss+word");
        assert_eq!(params["username"], "alice");
        assert_eq!(params["password"], "p@ss word");
    }

    #[test]
    fn keeps_invalid_escapes_verbatim() {
        assert_eq!(percent_decode("100%zz"), "100%zz");
        assert_eq!(percent_decode("50%"), "50%");
    }

    #[test]
    fn ignores_pairs_without_equals() {
        let params = parse("novalue&key=v");
        assert_eq!(params.len(), 1);
        assert_eq!(params["key"], "v");
    }
}
