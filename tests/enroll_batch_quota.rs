use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_enrolld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn enrolld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn register(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    sex: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "studentId": student_id,
            "lastName": format!("Apellido{}", student_id),
            "firstName": format!("Name{}", student_id),
            "sex": sex,
            "strand": "STEM",
            "gradeLevel": 11
        }),
    );
}

#[test]
fn batch_of_29_fills_section_a_to_male_quota_then_opens_b() {
    let workspace = temp_dir("enrolld-batch-quota");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    // 28 males then a single female, enrolled in registration order
    let mut ids: Vec<String> = Vec::new();
    for i in 0..28 {
        let sid = format!("m{:03}", i);
        register(&mut stdin, &mut reader, &format!("reg-{}", sid), &sid, "male");
        ids.push(sid);
    }
    register(&mut stdin, &mut reader, "reg-f000", "f000", "female");
    ids.push("f000".to_string());

    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "batch",
        "enroll.batch",
        json!({ "studentIds": ids }),
    );
    assert_eq!(batch.get("assignedCount").and_then(|v| v.as_i64()), Some(29));

    let results = batch
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("results array");
    assert_eq!(results.len(), 29);

    // first 23 males into A, males 24..28 spill into B, the female still
    // fits in A
    for (i, item) in results.iter().enumerate() {
        assert_eq!(item.get("ok").and_then(|v| v.as_bool()), Some(true), "{}", item);
        let name = item
            .pointer("/section/name")
            .and_then(|v| v.as_str())
            .expect("section name");
        let expected = if i < 23 || i == 28 { "A" } else { "B" };
        assert_eq!(name, expected, "student index {}", i);
    }

    let sections = request_ok(
        &mut stdin,
        &mut reader,
        "sections",
        "sections.list",
        json!({ "strand": "STEM", "gradeLevel": 11 }),
    );
    let rows = sections
        .get("sections")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("sections array");
    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].get("name").and_then(|v| v.as_str()), Some("A"));
    assert_eq!(rows[0].get("maleCount").and_then(|v| v.as_i64()), Some(23));
    assert_eq!(rows[0].get("femaleCount").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(rows[0].get("totalCount").and_then(|v| v.as_i64()), Some(24));

    assert_eq!(rows[1].get("name").and_then(|v| v.as_str()), Some("B"));
    assert_eq!(rows[1].get("maleCount").and_then(|v| v.as_i64()), Some(5));
    assert_eq!(rows[1].get("femaleCount").and_then(|v| v.as_i64()), Some(0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
