use anyhow::Context;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use scrypt::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Scrypt,
};

use crate::errors::{self, AppError};
use crate::schema::{files, posts, users};

no_arg_sql_function!(last_insert_rowid, diesel::sql_types::Integer);

embed_migrations!("migrations");

#[derive(Debug, Queryable)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Queryable)]
pub struct Post {
    pub id: i32,
    pub title: String,
    pub author: String,
    pub content: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct CreatePost {
    pub title: String,
    pub author: String,
    pub content: String,
}

#[derive(Debug, Queryable)]
pub struct File {
    pub id: i32,
    pub post_id: i32,
    pub stored_name: String,
}

/// Open a connection and bring the schema up to date. The rocket pool
/// opens its own connections, the server runs the migrations through
/// [`run_migrations`] at startup instead.
pub fn connect(db_url: &str) -> errors::Result<SqliteConnection> {
    let conn = SqliteConnection::establish(db_url)
        .with_context(|| format!("cannot open database at {}", db_url))?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &SqliteConnection) -> errors::Result<()> {
    embedded_migrations::run(conn).context("running embedded migrations")?;
    Ok(())
}

pub fn get_user(conn: &SqliteConnection, user_id: i32) -> errors::Result<Option<User>> {
    let user = users::table.find(user_id).first(conn).optional()?;
    Ok(user)
}

pub fn get_user_by_name(conn: &SqliteConnection, username: &str) -> errors::Result<Option<User>> {
    let user = users::table
        .filter(users::username.eq(username))
        .first(conn)
        .optional()?;
    Ok(user)
}

pub fn create_user(conn: &SqliteConnection, username: &str, password: &str) -> errors::Result<()> {
    let salt = SaltString::generate(&mut OsRng);
    let phc = Scrypt
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("cannot hash password: {}", err))?
        .to_string();

    let result = diesel::insert_into(users::table)
        .values((users::username.eq(username), users::password_hash.eq(phc)))
        .execute(conn);
    match result {
        Ok(_) => Ok(()),
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => Err(AppError::UserAlreadyExists(username.to_string())),
        Err(err) => Err(err.into()),
    }
}

/// Check a plaintext password against the stored PHC string. A hash that
/// fails to parse counts as a failed verification.
pub fn verify_password(user: &User, password: &str) -> bool {
    match PasswordHash::new(&user.password_hash) {
        Ok(parsed_hash) => Scrypt
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok(),
        Err(err) => {
            log::error!(
                "stored hash for user {} is not a valid PHC string: {}",
                user.username,
                err
            );
            false
        }
    }
}

/// All posts, newest first. Id breaks ties for posts created within the
/// same timestamp granularity.
pub fn list_posts(conn: &SqliteConnection) -> errors::Result<Vec<Post>> {
    let posts = posts::table
        .order((posts::created_at.desc(), posts::id.desc()))
        .load(conn)?;
    Ok(posts)
}

pub fn get_post(conn: &SqliteConnection, post_id: i32) -> errors::Result<Option<Post>> {
    let post = posts::table.find(post_id).first(conn).optional()?;
    Ok(post)
}

pub fn insert_post(conn: &SqliteConnection, post: &CreatePost) -> errors::Result<Post> {
    let now = chrono::Utc::now().naive_utc();
    diesel::insert_into(posts::table)
        .values((
            posts::title.eq(&post.title),
            posts::author.eq(&post.author),
            posts::content.eq(&post.content),
            posts::created_at.eq(now),
        ))
        .execute(conn)?;
    let new_id: i32 = diesel::select(last_insert_rowid).get_result(conn)?;
    let post = posts::table.find(new_id).first(conn)?;
    Ok(post)
}

pub fn insert_file(
    conn: &SqliteConnection,
    post_id: i32,
    stored_name: &str,
) -> errors::Result<()> {
    diesel::insert_into(files::table)
        .values((
            files::post_id.eq(post_id),
            files::stored_name.eq(stored_name),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn files_of_post(conn: &SqliteConnection, post_id: i32) -> errors::Result<Vec<File>> {
    let files = files::table
        .filter(files::post_id.eq(post_id))
        .order(files::id.asc())
        .load(conn)?;
    Ok(files)
}

pub fn get_file_by_name(
    conn: &SqliteConnection,
    stored_name: &str,
) -> errors::Result<Option<File>> {
    let file = files::table
        .filter(files::stored_name.eq(stored_name))
        .first(conn)
        .optional()?;
    Ok(file)
}

pub fn delete_files_of_post(conn: &SqliteConnection, post_id: i32) -> errors::Result<usize> {
    let n = diesel::delete(files::table.filter(files::post_id.eq(post_id))).execute(conn)?;
    Ok(n)
}

pub fn delete_post(conn: &SqliteConnection, post_id: i32) -> errors::Result<usize> {
    let n = diesel::delete(posts::table.find(post_id)).execute(conn)?;
    Ok(n)
}
