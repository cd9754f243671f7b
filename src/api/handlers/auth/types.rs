//! Request bodies for the auth endpoints. Responses come straight from the credential core.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::credentials::lifecycle::{LoginRequest, RegisterRequest, ResetPasswordRequest};

// Password fields are plain strings only until they are moved into `SecretString`; none of these
// types derive `Debug`.

#[derive(ToSchema, Deserialize)]
pub struct RegisterBody {
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl From<RegisterBody> for RegisterRequest {
    fn from(body: RegisterBody) -> Self {
        Self {
            email: body.email,
            password: SecretString::from(body.password),
            confirm_password: SecretString::from(body.confirm_password),
            first_name: body.first_name,
            last_name: body.last_name,
            phone_number: body.phone_number,
        }
    }
}

#[derive(ToSchema, Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
    #[serde(default)]
    pub device_name: Option<String>,
}

impl From<LoginBody> for LoginRequest {
    fn from(body: LoginBody) -> Self {
        Self {
            email: body.email,
            password: SecretString::from(body.password),
            remember_me: body.remember_me,
            device_name: body.device_name,
        }
    }
}

#[derive(ToSchema, Deserialize)]
pub struct RefreshBody {
    pub refresh_token: String,
}

#[derive(ToSchema, Deserialize)]
pub struct SessionTokenBody {
    pub session_token: String,
}

#[derive(ToSchema, Deserialize)]
pub struct VerifyEmailBody {
    pub token: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(ToSchema, Deserialize)]
pub struct EmailBody {
    pub email: String,
}

#[derive(ToSchema, Deserialize)]
pub struct ResetPasswordBody {
    pub token: String,
    pub new_password: String,
    pub confirm_password: String,
}

impl From<ResetPasswordBody> for ResetPasswordRequest {
    fn from(body: ResetPasswordBody) -> Self {
        Self {
            token: body.token,
            new_password: SecretString::from(body.new_password),
            confirm_password: SecretString::from(body.confirm_password),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}
