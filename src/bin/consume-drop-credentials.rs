//! Generates a session secret and a password hash for consume-drop.
//!
//! The printed lines can be pasted into `.env` or a compose file.

use argon2::Argon2;
use argon2::password_hash::{PasswordHasher, SaltString};
use rand::RngCore;
use rand::rngs::OsRng;
use std::process::ExitCode;

const SECRET_KEY_BYTES: usize = 32;

fn main() -> ExitCode {
    println!("=== consume-drop credentials ===");
    println!();

    let secret_key = generate_secret_key();
    println!("Generated SECRET_KEY:");
    println!("{secret_key}");
    println!();

    let password = match rpassword::prompt_password("Enter new password: ") {
        Ok(password) => password,
        Err(err) => {
            eprintln!("Error: could not read password: {err}");
            return ExitCode::FAILURE;
        }
    };
    if password.is_empty() {
        eprintln!("Error: password cannot be empty");
        return ExitCode::FAILURE;
    }
    let confirmation = match rpassword::prompt_password("Confirm password: ") {
        Ok(password) => password,
        Err(err) => {
            eprintln!("Error: could not read password: {err}");
            return ExitCode::FAILURE;
        }
    };
    if password != confirmation {
        eprintln!("Error: passwords do not match");
        return ExitCode::FAILURE;
    }

    let salt = SaltString::generate(&mut OsRng);
    let hash = match Argon2::default().hash_password(password.as_bytes(), &salt) {
        Ok(hash) => hash.to_string(),
        Err(err) => {
            eprintln!("Error: could not hash password: {err}");
            return ExitCode::FAILURE;
        }
    };

    println!();
    println!("Generated PASSWORD_HASH:");
    println!("{hash}");
    println!();
    println!("=== .env / docker-compose ===");
    println!("SECRET_KEY={secret_key}");
    println!("PASSWORD_HASH=\"{}\"", escape_for_compose(&hash));
    println!();
    println!("Compose files expand `$`, so every `$` above is doubled.");

    ExitCode::SUCCESS
}

fn generate_secret_key() -> String {
    let mut bytes = [0u8; SECRET_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn escape_for_compose(hash: &str) -> String {
    hash.replace('$', "$$")
}
