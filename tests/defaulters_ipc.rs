use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

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
    let exe = env!("CARGO_BIN_EXE_attendd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn attendd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}


const SHEET: &str = "\
,,,,Theory Subjects,,Lab Subjects,
,,,,SE(Th) Total=32,,DBMS(LAB) A= 10 B= 11,
Roll,UID,Name,Batch,SE attended,% attended,DBMS attended,% attended
1,U1,Asha,A1,28,87.5,9,90
2,U2,Ben,B1,12,37.5,5,45.45
";

fn setup(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
    uploads: &Path,
) {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    for (i, (uid, name, batch)) in [("U1", "Asha", "A1"), ("U2", "Ben", "B1")].iter().enumerate() {
        request_ok(
            stdin,
            reader,
            &format!("st-{}", i),
            "students.create",
            json!({ "uid": uid, "name": name, "division": "A", "batch": batch }),
        );
    }
    let se = request_ok(
        stdin,
        reader,
        "sub-se",
        "subjects.create",
        json!({ "name": "Software Engineering", "code": "SE" }),
    );
    let dbms = request_ok(
        stdin,
        reader,
        "sub-dbms",
        "subjects.create",
        json!({ "name": "Database Management Systems", "code": "DBMS" }),
    );
    request_ok(
        stdin,
        reader,
        "al-se",
        "allocations.create",
        json!({ "subjectId": se["subjectId"], "kind": "theory", "division": "A", "teacherId": "t1" }),
    );
    request_ok(
        stdin,
        reader,
        "al-dbms",
        "allocations.create",
        json!({ "subjectId": dbms["subjectId"], "kind": "practical", "division": "A", "batch": "B1", "teacherId": "t2" }),
    );

    let p = uploads.join("div-a.csv");
    std::fs::write(&p, SHEET).expect("write upload");
    request_ok(
        stdin,
        reader,
        "upload",
        "attendance.uploadDivisionSheet",
        json!({ "path": p.to_string_lossy(), "division": "A", "teacherId": "t1" }),
    );
}

fn subject_codes(student: &serde_json::Value) -> Vec<String> {
    let mut codes: Vec<String> = student["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .map(|s| s["code"].as_str().unwrap_or("").to_string())
        .collect();
    codes.sort();
    codes
}

#[test]
fn defaulters_are_listed_per_subject_and_scoped_to_the_teacher() {
    let workspace = temp_dir("attendd-defaulters");
    let uploads = temp_dir("attendd-defaulters-files");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace, &uploads);

    let all = request_ok(&mut stdin, &mut reader, "1", "defaulters.list", json!({}));
    assert_eq!(all["threshold"], json!(75.0));
    let students = all["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["uid"], json!("U2"));
    assert_eq!(subject_codes(&students[0]), vec!["DBMS", "SE"]);
    let se = students[0]["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .find(|s| s["code"] == json!("SE"))
        .expect("SE");
    assert_eq!(se["percentage"], json!(37.5));
    assert_eq!(se["kind"], json!("theory"));

    let low = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "defaulters.list",
        json!({ "threshold": 40 }),
    );
    assert_eq!(subject_codes(&low["students"][0]), vec!["SE"]);

    let t2 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "defaulters.list",
        json!({ "role": "teacher", "teacherId": "t2" }),
    );
    assert_eq!(subject_codes(&t2["students"][0]), vec!["DBMS"]);

    let nobody = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "defaulters.list",
        json!({ "role": "teacher", "teacherId": "t-unknown" }),
    );
    assert_eq!(nobody["count"], json!(0));

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "defaulters.list",
        json!({ "role": "admin", "teacherId": "t2" }),
    );
    assert_eq!(subject_codes(&admin["students"][0]), vec!["DBMS", "SE"]);

    let bad = request(
        &mut stdin,
        &mut reader,
        "6",
        "defaulters.list",
        json!({ "role": "teacher" }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(uploads);
}

#[test]
fn bands_bucket_overall_percentage() {
    let workspace = temp_dir("attendd-bands");
    let uploads = temp_dir("attendd-bands-files");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace, &uploads);

    // U1: 37/42 overall, unbanded. U2: 17/43 overall.
    let bands = request_ok(&mut stdin, &mut reader, "1", "defaulters.bands", json!({}));
    let below = bands["below50"].as_array().expect("below50");
    assert_eq!(below.len(), 1);
    assert_eq!(below[0]["uid"], json!("U2"));
    assert_eq!(below[0]["percentage"], json!(39.53));
    assert_eq!(bands["between50and65"], json!([]));
    assert_eq!(bands["between65and75"], json!([]));

    let other_division = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "defaulters.bands",
        json!({ "division": "b" }),
    );
    assert_eq!(other_division["below50"], json!([]));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(uploads);
}

#[test]
fn upload_triggers_a_background_defaulter_alert_for_the_teacher() {
    let workspace = temp_dir("attendd-defaulter-alert");
    let uploads = temp_dir("attendd-defaulter-alert-files");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    setup(&mut stdin, &mut reader, &workspace, &uploads);

    let deadline = Instant::now() + Duration::from_secs(10);
    let alert = loop {
        let res = request_ok(
            &mut stdin,
            &mut reader,
            "poll",
            "notifications.list",
            json!({ "audience": "user:t1", "event": "defaulters:alert" }),
        );
        if let Some(first) = res["notifications"].as_array().and_then(|a| a.first()) {
            break first.clone();
        }
        assert!(Instant::now() < deadline, "no defaulter alert published");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(alert["audience"], json!({ "kind": "user", "id": "t1" }));
    assert_eq!(alert["payload"]["division"], json!("A"));
    assert_eq!(alert["payload"]["count"], json!(1));

    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "admin",
        "notifications.list",
        json!({ "audience": "role:admin" }),
    );
    let events: Vec<&str> = admin["notifications"]
        .as_array()
        .expect("notifications")
        .iter()
        .filter_map(|n| n["event"].as_str())
        .collect();
    assert!(events.contains(&"attendance:uploaded"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(uploads);
}
