use multer::bytes::BytesMut;
use multer::{Constraints, Multipart, SizeLimit};
use rocket::data::{Data, ToByteUnit};
use rocket::fairing::AdHoc;
use rocket::form::{Form, FromForm};
use rocket::http::{Cookie, CookieJar};
use rocket::outcome::Outcome;
use rocket::request::{self, FlashMessage};
use rocket::response::{self, Flash, Redirect};
use rocket::tokio::fs;
use rocket::tokio::sync::Mutex;
use rocket::{http, uri, State};
use rocket_dyn_templates::Template;
use rocket_sync_db_pools::database;
use serde::Serialize;
use tokio_util::codec;

use diesel::Connection;

use crate::conf::AppConfig;
use crate::db;
use crate::errors::{self, AppError};
use crate::upload::{self, Upload};

#[database("factshield")]
pub struct DbConn(diesel::SqliteConnection);

// simplify sqlite tx by only supporting one writer at a time.
pub struct WriteLock(pub Mutex<()>);

const SESSION_COOKIE: &str = "user_id";

/// A logged-in administrator, identified by the private session cookie.
/// Forwards when there is no session, so protected routes can pair with a
/// rank 2 fallback that redirects to the login page.
pub struct AdminUser {
    pub id: i32,
    pub username: String,
}

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for AdminUser {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        let user_id = request
            .cookies()
            .get_private(SESSION_COOKIE)
            .and_then(|cookie| cookie.value().parse::<i32>().ok());
        let user_id = match user_id {
            Some(id) => id,
            None => return Outcome::Forward(()),
        };

        let conn = match request.guard::<DbConn>().await {
            Outcome::Success(conn) => conn,
            Outcome::Failure(_) | Outcome::Forward(_) => return Outcome::Forward(()),
        };

        match conn.run(move |c| db::get_user(c, user_id)).await {
            Ok(Some(user)) => Outcome::Success(AdminUser {
                id: user.id,
                username: user.username,
            }),
            // stale cookie referencing a deleted user
            Ok(None) => Outcome::Forward(()),
            Err(err) => {
                log::error!("cannot load session user: {:?}", err);
                Outcome::Forward(())
            }
        }
    }
}

#[derive(Debug)]
struct MultipartBoundary<'r>(&'r str);

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for MultipartBoundary<'r> {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r rocket::Request<'_>) -> request::Outcome<Self, Self::Error> {
        let ct = request.guard::<&http::ContentType>().await;
        ct.and_then(|ct| match ct.media_type().param("boundary").as_ref() {
            Some(boundary) => request::Outcome::Success(MultipartBoundary(boundary)),
            None => request::Outcome::Forward(()),
        })
    }
}

#[derive(Serialize)]
struct FlashData {
    color: &'static str,
    message: String,
}

impl<'f> std::convert::From<FlashMessage<'f>> for FlashData {
    fn from(flash: FlashMessage) -> Self {
        let color = match flash.kind() {
            "success" => "limegreen",
            "error" => "red",
            "warning" => "orange",
            _ => "default",
        };
        FlashData {
            color,
            message: flash.message().to_string(),
        }
    }
}

#[derive(Serialize)]
struct PostView {
    id: i32,
    title: String,
    author: String,
    content: String,
    created_at: String,
    created_at_human: String,
}

impl From<db::Post> for PostView {
    fn from(post: db::Post) -> Self {
        let utc = chrono::DateTime::<chrono::Utc>::from_utc(post.created_at, chrono::Utc);
        PostView {
            id: post.id,
            title: post.title,
            author: post.author,
            content: post.content,
            created_at: utc.format("%F %R").to_string(),
            created_at_human: chrono_humanize::HumanTime::from(utc).to_string(),
        }
    }
}

#[derive(Serialize)]
struct FileView {
    stored_name: String,
    dl_uri: String,
}

impl From<db::File> for FileView {
    fn from(file: db::File) -> Self {
        let dl_uri = uri!(download_file(&file.stored_name)).to_string();
        FileView {
            stored_name: file.stored_name,
            dl_uri,
        }
    }
}

#[derive(Serialize)]
struct IndexView {
    posts: Vec<PostView>,
    flash: Option<FlashData>,
}

#[rocket::get("/")]
async fn index(conn: DbConn, flash: Option<FlashMessage<'_>>) -> errors::Result<Template> {
    let posts = conn.run(|c| db::list_posts(c)).await?;
    let ctx = IndexView {
        posts: posts.into_iter().map(Into::into).collect(),
        flash: flash.map(|f| f.into()),
    };
    Ok(Template::render("index", &ctx))
}

#[derive(Serialize)]
struct DetailView {
    post: PostView,
    files: Vec<FileView>,
}

#[rocket::get("/post/<post_id>")]
async fn post_detail(post_id: i32, conn: DbConn) -> errors::Result<Option<Template>> {
    let found = conn
        .run(move |c| -> errors::Result<_> {
            let post = match db::get_post(c, post_id)? {
                None => return Ok(None),
                Some(post) => post,
            };
            let files = db::files_of_post(c, post.id)?;
            Ok(Some((post, files)))
        })
        .await?;

    match found {
        None => Ok(None),
        Some((post, files)) => {
            let ctx = DetailView {
                post: post.into(),
                files: files.into_iter().map(Into::into).collect(),
            };
            Ok(Some(Template::render("post_detail", &ctx)))
        }
    }
}

#[derive(Serialize)]
struct LoginView {
    flash: Option<FlashData>,
}

#[rocket::get("/login")]
fn login_get(
    user: Option<AdminUser>,
    flash: Option<FlashMessage<'_>>,
) -> Result<Redirect, Template> {
    if user.is_some() {
        return Ok(Redirect::to(uri!(admin_get)));
    }
    let ctx = LoginView {
        flash: flash.map(|f| f.into()),
    };
    Err(Template::render("login", &ctx))
}

#[derive(Debug, FromForm)]
struct LoginInput<'r> {
    username: &'r str,
    password: &'r str,
}

#[rocket::post("/login", data = "<form_input>")]
async fn login_post(
    form_input: Form<LoginInput<'_>>,
    conn: DbConn,
    cookies: &CookieJar<'_>,
) -> errors::Result<Result<Redirect, Flash<Redirect>>> {
    let username = form_input.username.trim().to_string();
    let password = form_input.password.to_string();

    let user = conn.run(move |c| db::get_user_by_name(c, &username)).await?;

    // one generic failure path, whether the user is unknown or the
    // password is wrong
    match user {
        Some(user) if db::verify_password(&user, &password) => {
            log::info!("user {} logged in", user.username);
            cookies.add_private(Cookie::new(SESSION_COOKIE, user.id.to_string()));
            Ok(Ok(Redirect::to(uri!(admin_get))))
        }
        _ => Ok(Err(Flash::error(
            Redirect::to(uri!(login_get)),
            "Invalid credentials.",
        ))),
    }
}

#[rocket::get("/logout")]
fn logout(_user: AdminUser, cookies: &CookieJar<'_>) -> Flash<Redirect> {
    cookies.remove_private(Cookie::named(SESSION_COOKIE));
    Flash::success(Redirect::to(uri!(index)), "Logged out.")
}

#[rocket::get("/logout", rank = 2)]
fn logout_anon() -> Redirect {
    Redirect::to(uri!(login_get))
}

#[derive(Serialize)]
struct AdminView {
    username: String,
    posts: Vec<PostView>,
    flash: Option<FlashData>,
}

#[rocket::get("/admin")]
async fn admin_get(
    user: AdminUser,
    conn: DbConn,
    flash: Option<FlashMessage<'_>>,
) -> errors::Result<Template> {
    let posts = conn.run(|c| db::list_posts(c)).await?;
    let ctx = AdminView {
        username: user.username,
        posts: posts.into_iter().map(Into::into).collect(),
        flash: flash.map(|f| f.into()),
    };
    Ok(Template::render("admin", &ctx))
}

#[rocket::get("/admin", rank = 2)]
fn admin_get_anon() -> Redirect {
    Redirect::to(uri!(login_get))
}

struct PostSubmission {
    post: db::CreatePost,
    uploads: Vec<Upload>,
}

/// Buffer the whole multipart submission before touching the database or
/// the disk. The whole-stream limit rejects oversized requests here,
/// before anything is written.
async fn read_submission(
    data: Data<'_>,
    boundary: &str,
    max_bytes: u64,
) -> errors::Result<PostSubmission> {
    // a limit on data.open() would make rocket cut the connection, which
    // browsers show as a reset page. multer reports a proper error instead.
    let stream =
        codec::FramedRead::new(data.open(usize::MAX.mebibytes()), codec::BytesCodec::new());

    // 10 kiB of slack for the boundaries and part headers
    let constraints = Constraints::new()
        .allowed_fields(vec!["title", "author", "content", "files"])
        .size_limit(SizeLimit::new().whole_stream(max_bytes + 10 * 1024));
    let mut multipart = Multipart::with_constraints(stream, boundary.to_string(), constraints);

    let mut post = db::CreatePost {
        title: String::new(),
        author: String::new(),
        content: String::new(),
    };
    let mut uploads = Vec::new();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => post.title = field.text().await?.trim().to_string(),
            "author" => post.author = field.text().await?.trim().to_string(),
            "content" => post.content = field.text().await?.trim().to_string(),
            "files" => {
                // a form submitted without a selection still sends one
                // part, with an empty filename
                let original_name = match field.file_name() {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => continue,
                };
                let mut buf = BytesMut::new();
                while let Some(chunk) = field.chunk().await? {
                    buf.extend_from_slice(&chunk);
                }
                uploads.push(Upload {
                    original_name,
                    content: buf.freeze(),
                });
            }
            _ => continue,
        }
    }

    Ok(PostSubmission { post, uploads })
}

#[rocket::post("/admin", data = "<data>")]
async fn admin_post(
    _user: AdminUser,
    conn: DbConn,
    data: Data<'_>,
    boundary: MultipartBoundary<'_>,
    config: &State<AppConfig>,
    write_lock: &State<WriteLock>,
) -> errors::Result<Flash<Redirect>> {
    let submission = read_submission(data, boundary.0, config.max_upload_bytes()).await?;

    if submission.post.title.is_empty()
        || submission.post.author.is_empty()
        || submission.post.content.is_empty()
    {
        return Ok(Flash::error(
            Redirect::to(uri!(admin_get)),
            "Title/Author/Content required.",
        ));
    }

    let upload_dir = config.upload_dir.clone();
    let created = {
        let _guard = write_lock.0.lock().await;
        conn.run(move |c| {
            c.transaction::<_, AppError, _>(|| {
                let post = db::insert_post(c, &submission.post)?;
                let stored =
                    upload::persist_uploads(c, &upload_dir, post.id, &submission.uploads)?;
                Ok((post, stored))
            })
        })
        .await?
    };

    let (post, stored) = created;
    log::info!(
        "created case file {} with {} attachment(s)",
        post.id,
        stored.len()
    );
    Ok(Flash::success(
        Redirect::to(uri!(admin_get)),
        "Case file added successfully.",
    ))
}

#[rocket::post("/admin", rank = 2)]
fn admin_post_anon() -> Redirect {
    Redirect::to(uri!(login_get))
}

#[rocket::post("/admin/delete/<post_id>")]
async fn delete_post(
    post_id: i32,
    _user: AdminUser,
    conn: DbConn,
    config: &State<AppConfig>,
    write_lock: &State<WriteLock>,
) -> errors::Result<Option<Flash<Redirect>>> {
    let upload_dir = config.upload_dir.clone();
    let deleted = {
        let _guard = write_lock.0.lock().await;
        conn.run(move |c| {
            c.transaction::<_, AppError, _>(|| {
                let post = match db::get_post(c, post_id)? {
                    None => return Ok(false),
                    Some(post) => post,
                };
                for file in db::files_of_post(c, post.id)? {
                    let path = upload_dir.join(&file.stored_name);
                    // best effort: row deletion proceeds even when the
                    // object is already gone or cannot be removed
                    if let Err(err) = std::fs::remove_file(&path) {
                        log::warn!("could not remove {}: {}", path.display(), err);
                    }
                }
                db::delete_files_of_post(c, post.id)?;
                db::delete_post(c, post.id)?;
                Ok(true)
            })
        })
        .await?
    };

    if deleted {
        log::info!("deleted case file {}", post_id);
        Ok(Some(Flash::success(
            Redirect::to(uri!(admin_get)),
            "Case file deleted.",
        )))
    } else {
        Ok(None)
    }
}

#[rocket::post("/admin/delete/<_post_id>", rank = 2)]
fn delete_post_anon(_post_id: i32) -> Redirect {
    Redirect::to(uri!(login_get))
}

/// A stored file streamed back as a download.
pub struct Attachment {
    file: fs::File,
    name: String,
}

impl<'r> response::Responder<'r, 'static> for Attachment {
    fn respond_to(self, request: &'r rocket::Request<'_>) -> response::Result<'static> {
        // stored names are sanitized, so quoting them directly is fine
        let disposition = http::Header::new(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", self.name),
        );
        response::Response::build_from(self.file.respond_to(request)?)
            .header(http::ContentType::Binary)
            .header(disposition)
            .ok()
    }
}

#[rocket::get("/uploads/<filename>")]
async fn download_file(
    filename: String,
    conn: DbConn,
    config: &State<AppConfig>,
) -> errors::Result<Option<Attachment>> {
    let requested = filename.clone();
    let file = conn
        .run(move |c| db::get_file_by_name(c, &requested))
        .await?;
    let file = match file {
        // never serve anything without a matching row, even if a
        // same-named object happens to exist on disk
        None => return Ok(None),
        Some(file) => file,
    };

    let path = config.upload_dir.join(&file.stored_name);
    match fs::File::open(&path).await {
        Ok(fd) => Ok(Some(Attachment {
            file: fd,
            name: file.stored_name,
        })),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::error!("file row {} has no object at {}", file.id, path.display());
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn build_app(figment: figment::Figment) -> rocket::Rocket<rocket::Build> {
    rocket::custom(figment)
        .mount(
            "/",
            rocket::routes![
                index,
                post_detail,
                login_get,
                login_post,
                logout,
                logout_anon,
                admin_get,
                admin_get_anon,
                admin_post,
                admin_post_anon,
                delete_post,
                delete_post_anon,
                download_file,
            ],
        )
        .attach(Template::fairing())
        .attach(DbConn::fairing())
        .attach(AdHoc::config::<AppConfig>())
        .manage(WriteLock(Mutex::new(())))
}
