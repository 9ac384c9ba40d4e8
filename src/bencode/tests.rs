use bytes::Bytes;

use super::*;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Integer(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
}

#[test]
fn test_decode_integer_invalid() {
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"i03e").is_err());
    assert!(decode(b"ie").is_err());
    assert!(decode(b"i12").is_err());
}

#[test]
fn test_decode_bytes() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
    assert!(matches!(
        decode(b"5:spam"),
        Err(BencodeError::UnexpectedEof(_))
    ));
}

#[test]
fn test_decode_binary_bytes() {
    let data = b"6:\x00\xff\x01\x02\x1a\xe1";
    let value = decode(data).unwrap();
    assert_eq!(value.as_bytes().unwrap().as_ref(), &data[2..]);
    assert_eq!(value.as_str(), None);
}

#[test]
fn test_decode_list_and_dict() {
    let value = decode(b"d4:listl4:spami42ee3:cow3:mooe").unwrap();
    assert_eq!(value.get(b"cow").and_then(|v| v.as_str()), Some("moo"));

    let list = value.get(b"list").and_then(|v| v.as_list()).unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[1], Value::Integer(42));
    assert_eq!(value.get(b"missing"), None);
}

#[test]
fn test_dict_key_must_be_string() {
    assert_eq!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey));
}

#[test]
fn test_trailing_data_error() {
    assert_eq!(decode(b"i42eextra"), Err(BencodeError::TrailingData));
}

#[test]
fn test_nesting_limit() {
    let mut data = vec![b'l'; 100];
    data.extend(vec![b'e'; 100]);
    assert_eq!(decode(&data), Err(BencodeError::NestingTooDeep));
}
