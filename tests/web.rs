use std::path::PathBuf;

use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;

use factshield::{db, web};

const BOUNDARY: &str = "X-FACTSHIELD-TEST-BOUNDARY";

struct TestApp {
    client: Client,
    upload_dir: PathBuf,
    // drop order keeps the scratch dir alive for the client's lifetime
    _dir: tempfile::TempDir,
}

fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let upload_dir = dir.path().join("uploads");
    std::fs::create_dir_all(&upload_dir).unwrap();

    // migrate and seed the admin account outside the pool
    let conn = db::connect(db_path.to_str().unwrap()).unwrap();
    db::create_user(&conn, "admin", "hunter2").unwrap();
    drop(conn);

    let figment = rocket::Config::figment()
        .merge(("databases.factshield.url", db_path.to_str().unwrap()))
        .merge(("upload_dir", upload_dir.to_str().unwrap()))
        .merge(("max_upload_mib", 1u64));
    let client = Client::tracked(web::build_app(figment)).expect("valid rocket instance");

    TestApp {
        client,
        upload_dir,
        _dir: dir,
    }
}

fn login(client: &Client) {
    let resp = client
        .post("/login")
        .header(ContentType::Form)
        .body("username=admin&password=hunter2")
        .dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/admin"));
}

fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &[u8])]) -> (Header<'static>, Vec<u8>) {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    for (filename, content) in files {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    let header = Header::new(
        "Content-Type",
        format!("multipart/form-data; boundary={}", BOUNDARY),
    );
    (header, body)
}

fn create_case_file(client: &Client, title: &str, files: &[(&str, &[u8])]) {
    let (header, body) = multipart_body(
        &[("title", title), ("author", "Kim"), ("content", "Body")],
        files,
    );
    let resp = client.post("/admin").header(header).body(body).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/admin"));
}

#[test]
fn anonymous_visitors_are_redirected_to_login() {
    let app = spawn_app();

    for resp in [
        app.client.get("/admin").dispatch(),
        app.client.post("/admin").dispatch(),
        app.client.post("/admin/delete/1").dispatch(),
        app.client.get("/logout").dispatch(),
    ] {
        assert_eq!(resp.status(), Status::SeeOther);
        assert_eq!(resp.headers().get_one("Location"), Some("/login"));
    }
}

#[test]
fn bad_credentials_show_the_same_generic_error_and_leave_no_session() {
    let app = spawn_app();

    for body in ["username=admin&password=nope", "username=nobody&password=x"] {
        let resp = app
            .client
            .post("/login")
            .header(ContentType::Form)
            .body(body)
            .dispatch();
        assert_eq!(resp.status(), Status::SeeOther);
        assert_eq!(resp.headers().get_one("Location"), Some("/login"));

        let page = app.client.get("/login").dispatch();
        assert!(page
            .into_string()
            .unwrap()
            .contains("Invalid credentials."));

        let admin = app.client.get("/admin").dispatch();
        assert_eq!(admin.status(), Status::SeeOther);
        assert_eq!(admin.headers().get_one("Location"), Some("/login"));
    }
}

#[test]
fn login_establishes_a_session_for_protected_routes() {
    let app = spawn_app();
    login(&app.client);

    let resp = app.client.get("/admin").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp.into_string().unwrap().contains("Logged in as admin"));

    // an authenticated user asking for the login page lands on the dashboard
    let resp = app.client.get("/login").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/admin"));

    let resp = app.client.get("/logout").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/"));

    let resp = app.client.get("/admin").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/login"));
}

#[test]
fn created_case_files_are_listed_and_downloadable() {
    let app = spawn_app();
    login(&app.client);

    create_case_file(&app.client, "Alpha", &[("report.txt", b"hello")]);

    let listing = app.client.get("/").dispatch().into_string().unwrap();
    assert!(listing.contains("Alpha"));

    let detail = app.client.get("/post/1").dispatch();
    assert_eq!(detail.status(), Status::Ok);
    assert!(detail.into_string().unwrap().contains("1_report.txt"));

    let dl = app.client.get("/uploads/1_report.txt").dispatch();
    assert_eq!(dl.status(), Status::Ok);
    assert!(dl
        .headers()
        .get_one("Content-Disposition")
        .unwrap()
        .starts_with("attachment"));
    assert_eq!(dl.into_string().unwrap(), "hello");
}

#[test]
fn empty_author_is_rejected_without_side_effects() {
    let app = spawn_app();
    login(&app.client);

    let (header, body) = multipart_body(
        &[("title", "Beta"), ("author", "   "), ("content", "Body")],
        &[("note.txt", b"should not land")],
    );
    let resp = app.client.post("/admin").header(header).body(body).dispatch();
    assert_eq!(resp.status(), Status::SeeOther);

    let dashboard = app.client.get("/admin").dispatch().into_string().unwrap();
    assert!(dashboard.contains("Title/Author/Content required."));

    let listing = app.client.get("/").dispatch().into_string().unwrap();
    assert!(!listing.contains("Beta"));

    assert_eq!(std::fs::read_dir(&app.upload_dir).unwrap().count(), 0);
    let dl = app.client.get("/uploads/1_note.txt").dispatch();
    assert_eq!(dl.status(), Status::NotFound);
}

#[test]
fn deleting_a_post_removes_detail_and_downloads() {
    let app = spawn_app();
    login(&app.client);

    create_case_file(&app.client, "Alpha", &[("report.txt", b"hello")]);

    let resp = app.client.post("/admin/delete/1").dispatch();
    assert_eq!(resp.status(), Status::SeeOther);
    assert_eq!(resp.headers().get_one("Location"), Some("/admin"));

    assert_eq!(app.client.get("/post/1").dispatch().status(), Status::NotFound);
    assert_eq!(
        app.client.get("/uploads/1_report.txt").dispatch().status(),
        Status::NotFound
    );
    assert_eq!(std::fs::read_dir(&app.upload_dir).unwrap().count(), 0);

    // deleting again is a straight 404
    let resp = app.client.post("/admin/delete/1").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn downloads_require_a_matching_file_row() {
    let app = spawn_app();

    std::fs::write(app.upload_dir.join("ghost.txt"), b"not yours").unwrap();
    let resp = app.client.get("/uploads/ghost.txt").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn oversized_uploads_are_rejected_before_any_write() {
    let app = spawn_app();
    login(&app.client);

    // 2 MiB against the 1 MiB test ceiling
    let big = vec![0u8; 2 * 1024 * 1024];
    let (header, body) = multipart_body(
        &[("title", "Big"), ("author", "Kim"), ("content", "Body")],
        &[("big.bin", &big)],
    );
    let resp = app.client.post("/admin").header(header).body(body).dispatch();
    assert_eq!(resp.status(), Status::PayloadTooLarge);

    assert_eq!(std::fs::read_dir(&app.upload_dir).unwrap().count(), 0);
    let listing = app.client.get("/").dispatch().into_string().unwrap();
    assert!(!listing.contains("Big"));
}
