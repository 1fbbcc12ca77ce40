use std::rc::Rc;

use rand::Rng;
use sio::objects::{
    bytes_to_int, dumps, int_to_bytes, loads, marshal_header, parse_header, unpack_preheader,
    Error, Header, ObjectFile, PreHeader, Value, TYPE_TUPLE,
};

mod util;

fn rc(value: Value) -> Rc<Value> {
    Rc::new(value)
}

#[test]
fn a_zero_preheader_byte_selects_full_widths() {
    assert_eq!(
        unpack_preheader(0),
        PreHeader {
            id_size: 32,
            length_size: 32,
            kind: TYPE_TUPLE,
        }
    );
}

#[test]
fn random_headers_round_trip() {
    let mut rng = rand::rng();
    for _ in 0..10_000 {
        let id = u64::from(rng.random::<u32>());
        let kind = rng.random_range(0..4u8);
        let length = u64::from(rng.random::<u32>());

        let encoded = marshal_header(id, kind, length);
        let (header, consumed) = parse_header(&encoded).expect("undecodable header");
        assert_eq!(consumed, encoded.len());
        assert_eq!(header, Header { id, kind, length });
    }
}

#[test]
fn random_integers_round_trip() {
    let mut rng = rand::rng();
    for _ in 0..10_000 {
        let n = rng.random::<i64>();
        assert_eq!(bytes_to_int(&int_to_bytes(n)).expect("undecodable"), n);
    }
    for n in [0, 1, -1, i64::MAX, i64::MIN] {
        assert_eq!(bytes_to_int(&int_to_bytes(n)).unwrap(), n);
    }
}

#[test]
fn a_mixed_composite_round_trips() {
    // (42, "asdf", ["hehe"])
    let value = rc(Value::Tuple(vec![
        rc(Value::Int(42)),
        rc(Value::from("asdf")),
        rc(Value::List(vec![rc(Value::from("hehe"))])),
    ]));
    let decoded = loads(&dumps(&value)).expect("decode failed");
    assert_eq!(decoded, value);

    let Value::Tuple(members) = &*decoded else {
        panic!("expected a tuple");
    };
    assert!(matches!(&*members[2], Value::List(..)));
}

#[test]
fn shared_subvalues_come_back_shared() {
    let shared = rc(Value::Dict(vec![(
        rc(Value::from("key")),
        rc(Value::Int(1)),
    )]));
    let value = rc(Value::List(vec![
        shared.clone(),
        rc(Value::Int(0)),
        shared,
    ]));
    let decoded = loads(&dumps(&value)).expect("decode failed");
    let Value::List(members) = &*decoded else {
        panic!("expected a list");
    };
    assert!(Rc::ptr_eq(&members[0], &members[2]));
}

#[test]
fn truncated_input_is_malformed() {
    let encoded = dumps(&rc(Value::from("payload")));
    assert!(matches!(
        loads(&encoded[..encoded.len() - 1]),
        Err(Error::TruncatedPayload)
    ));
}

#[test]
fn object_files_carry_framed_values() {
    let (c, d) = util::pair();
    let writer = ObjectFile::new(c);
    let reader = ObjectFile::new(d);
    util::block_on(async move {
        let values = [
            rc(Value::Int(-7)),
            rc(Value::from("text")),
            rc(Value::Tuple(vec![
                rc(Value::from(b"bytes".as_slice())),
                rc(Value::Set(vec![rc(Value::Int(1)), rc(Value::Int(2))])),
            ])),
        ];
        for value in &values {
            writer.write_object(value).await.expect("write failed");
        }
        writer.get_ref().close(true).await.unwrap();

        let mut stream = reader.read_object_stream();
        let mut decoded = Vec::new();
        while let Some(value) = stream.next().await.expect("read failed") {
            decoded.push(value);
        }
        assert_eq!(decoded, values);
    });
}

#[test]
fn a_split_frame_reassembles() {
    let (c, d) = util::pair();
    let reader = ObjectFile::new(d);
    util::block_on(async move {
        let value = rc(Value::List(vec![
            rc(Value::from("a longer payload that will not fit a tiny write")),
            rc(Value::Int(123_456_789)),
        ]));
        let encoded = dumps(&value);

        // Dribble the frame a few bytes at a time.
        let writer = c.clone();
        let dribble = encoded.clone();
        spawn_dribbler(writer, dribble);

        let decoded = reader.read_object().await.expect("read failed");
        assert_eq!(decoded, Some(value));
    });
}

fn spawn_dribbler(writer: sio::ScheduledFile, data: Vec<u8>) {
    sio::spawn(async move {
        for piece in data.chunks(3) {
            writer.write(piece).await.expect("dribble write failed");
            writer.flush(true).await;
        }
    });
}
