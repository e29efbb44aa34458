use anyhow::Result;
use bulkflow::DecodePolicy;
use bulkflow::io::compression::wrap_reader;
use bulkflow::io::format::{Compression, Format, detect_file};
use bulkflow::io::{DecodeContext, csv, json, jsonl, parquet};
use bulkflow::testing::*;
use bulkflow::{IngestError, Record};
use serde_json::{Value, json};
use std::fs::File;
use std::io::BufReader;

fn skip() -> DecodeContext {
    DecodeContext::new("test", DecodePolicy::default())
}

fn drain_jsonl(path: &std::path::Path, compression: Compression) -> Result<Vec<Record>> {
    let reader = wrap_reader(Box::new(File::open(path)?), compression)?;
    let mut out = Vec::new();
    jsonl::decode(BufReader::new(reader), &mut skip(), &mut |r| {
        out.push(r);
        true
    })?;
    Ok(out)
}

#[test]
fn detection_by_extension_and_content() -> Result<()> {
    let dir = TempDirPath::new()?;
    let recs = events(5);

    let jl = write_jsonl(&dir.file_path("a.jsonl"), &recs)?;
    let gz = write_jsonl(&dir.file_path("a.ndjson.gz"), &recs)?;
    let arr = write_json_array(&dir.file_path("a.json"), &recs)?;
    let lines_as_json = write_jsonl(&dir.file_path("lines.json"), &recs)?;
    let bare = write_jsonl(&dir.file_path("export"), &recs)?;
    let bare_gz = write_jsonl(&dir.file_path("export2.gz"), &recs)?;
    let tsv = write_text(&dir.file_path("t.tsv"), "a\tb\n1\t2\n")?;

    let d = detect_file(&jl, None, None)?;
    assert_eq!((d.format, d.compression), (Format::Jsonl, Compression::None));
    let d = detect_file(&gz, None, None)?;
    assert_eq!((d.format, d.compression), (Format::Jsonl, Compression::Gzip));
    assert_eq!(detect_file(&arr, None, None)?.format, Format::Json);
    assert_eq!(detect_file(&lines_as_json, None, None)?.format, Format::Jsonl);
    assert_eq!(detect_file(&bare, None, None)?.format, Format::Jsonl);
    let d = detect_file(&bare_gz, None, None)?;
    assert_eq!((d.format, d.compression), (Format::Jsonl, Compression::Gzip));
    let d = detect_file(&tsv, None, None)?;
    assert_eq!((d.format, d.delimiter), (Format::Csv, b'\t'));

    // Declarations win over names.
    let d = detect_file(&jl, Some(Format::Csv), Some(Compression::Gzip))?;
    assert_eq!((d.format, d.compression), (Format::Csv, Compression::Gzip));
    Ok(())
}

#[test]
fn gzip_jsonl_streams_in_order() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = write_jsonl(&dir.file_path("big.jsonl.gz"), &events(2_000))?;
    let back = drain_jsonl(&path, Compression::Gzip)?;
    assert_eq!(sequence_of(&back), (0..2_000).collect::<Vec<_>>());
    Ok(())
}

#[cfg(feature = "compression-zstd")]
#[test]
fn zstd_by_magic_bytes() -> Result<()> {
    use std::io::Read;
    let dir = TempDirPath::new()?;
    let path = write_jsonl(&dir.file_path("z.jsonl.zst"), &events(10))?;
    let renamed = dir.file_path("z-no-ext");
    std::fs::rename(&path, &renamed)?;
    let mut text = String::new();
    let detected = detect_file(&renamed, None, None)?;
    assert_eq!(detected.compression, Compression::Zstd);
    assert_eq!(detected.format, Format::Jsonl);
    wrap_reader(Box::new(File::open(&renamed)?), detected.compression)?
        .read_to_string(&mut text)?;
    assert_eq!(text.lines().count(), 10);
    Ok(())
}

#[test]
fn jsonl_bad_lines_follow_policy() -> Result<()> {
    let text = "{\"i\":1}\n\nnot json\n[1,2]\n{\"i\":2}\n";
    let mut ctx = skip();
    let recs = jsonl::decode_str(text, &mut ctx)?;
    assert_eq!(recs.len(), 2);
    assert_eq!(ctx.skipped(), 2);

    let mut strict = DecodeContext::new("strict", DecodePolicy::Strict);
    match jsonl::decode_str(text, &mut strict) {
        Err(IngestError::Decode { position, .. }) => assert_eq!(position, 3),
        other => panic!("expected a decode error, got {other:?}"),
    }

    let mut capped = DecodeContext::new("capped", DecodePolicy::Skip { max_errors: 1 });
    assert!(jsonl::decode_str(text, &mut capped).is_err());
    Ok(())
}

#[test]
fn jsonl_invalid_utf8_is_a_bad_line() -> Result<()> {
    let bytes: &[u8] = b"{\"a\":1}\n{\"a\":\"\xff\xfe\"}\n{\"a\":3}\n";

    let mut ctx = skip();
    let mut streamed = Vec::new();
    jsonl::decode(bytes, &mut ctx, &mut |r| {
        streamed.push(r);
        true
    })?;
    assert_eq!(streamed.len(), 2);
    assert_eq!(streamed[1]["a"], 3);
    assert_eq!(ctx.skipped(), 1);

    let mut ctx = skip();
    let whole = jsonl::decode_bytes(bytes, &mut ctx)?;
    assert_eq!(whole, streamed);
    assert_eq!(ctx.skipped(), 1);

    let mut strict = DecodeContext::new("strict", DecodePolicy::Strict);
    match jsonl::decode(bytes, &mut strict, &mut |_| true) {
        Err(IngestError::Decode { position, message, .. }) => {
            assert_eq!(position, 2);
            assert!(message.contains("UTF-8"), "{message}");
        }
        other => panic!("expected a decode error, got {other:?}"),
    }
    let mut strict = DecodeContext::new("strict", DecodePolicy::Strict);
    assert!(matches!(
        jsonl::decode_bytes(bytes, &mut strict),
        Err(IngestError::Decode { position: 2, .. })
    ));
    Ok(())
}

#[test]
fn json_array_streams_from_file() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = write_json_array(&dir.file_path("arr.json.gz"), &events(500))?;
    let reader = wrap_reader(Box::new(File::open(&path)?), Compression::Gzip)?;
    let mut out = Vec::new();
    json::decode(BufReader::new(reader), &mut skip(), &mut |r| {
        out.push(r);
        true
    })?;
    assert_eq!(out.len(), 500);
    assert_eq!(out[499]["event"], "event-499");
    Ok(())
}

#[test]
fn csv_cells_are_typed() -> Result<()> {
    let text = "\u{feff}id,name,active,score,zip,empty\n1,ann,true,2.5,02134,\n2,bob,false,-3,10001,x\n";
    let recs = csv::decode_str(text, b',', &mut skip())?;
    assert_eq!(recs.len(), 2);
    let first = Value::Object(recs[0].clone());
    assert_eq!(
        first,
        json!({"id": 1, "name": "ann", "active": true, "score": 2.5, "zip": "02134"})
    );
    assert_eq!(recs[1]["score"], -3);
    assert_eq!(recs[1]["empty"], "x");
    Ok(())
}

#[test]
fn csv_ragged_rows_are_decode_errors() -> Result<()> {
    let text = "a,b\n1,2\n1,2,3\n4,5\n";
    let mut ctx = skip();
    let recs = csv::decode_str(text, b',', &mut ctx)?;
    assert_eq!(recs.len(), 2);
    assert_eq!(ctx.skipped(), 1);
    Ok(())
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Row {
    id: i64,
    big: u64,
    name: String,
    score: Option<f64>,
}

fn write_parquet(path: &std::path::Path, rows: &[Row]) -> Result<()> {
    use arrow::datatypes::FieldRef;
    use ::parquet::arrow::ArrowWriter;
    use serde_arrow::schema::{SchemaLike, TracingOptions};

    let fields = Vec::<FieldRef>::from_type::<Row>(TracingOptions::default())?;
    let batch = serde_arrow::to_record_batch(&fields, &rows)?;
    let mut writer = ArrowWriter::try_new(File::create(path)?, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

#[test]
fn parquet_values_are_sanitized() -> Result<()> {
    let dir = TempDirPath::new()?;
    let path = dir.file_path("rows.parquet");
    write_parquet(
        &path,
        &[
            Row {
                id: 1,
                big: 7,
                name: "a".into(),
                score: Some(0.5),
            },
            Row {
                id: 2,
                big: u64::MAX,
                name: "b".into(),
                score: None,
            },
        ],
    )?;
    assert_eq!(detect_file(&path, None, None)?.format, Format::Parquet);

    let mut out = Vec::new();
    parquet::decode_file(&path, &mut skip(), &mut |r| {
        out.push(r);
        true
    })?;
    assert_eq!(out.len(), 2);
    assert_eq!(out[0]["big"], 7);
    assert_eq!(out[0]["score"], 0.5);
    assert_eq!(out[1]["big"], Value::String(u64::MAX.to_string()));
    assert!(out[1]["score"].is_null());
    assert_eq!(out[1]["name"], "b");
    Ok(())
}

#[test]
fn parquet_garbage_is_a_decode_error() {
    let dir = TempDirPath::new().unwrap();
    let path = write_text(&dir.file_path("bad.parquet"), "PAR1 not really").unwrap();
    let err = parquet::decode_file(&path, &mut skip(), &mut |_| true).unwrap_err();
    assert!(matches!(err, IngestError::Decode { .. }));
}
