use serde::Serialize;

use super::AppError;

/// `{ success, data, message }` wrapper printed by `--json`.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            status: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl Envelope<()> {
    pub fn error(err: &AppError) -> Self {
        Self::failure(err.to_string(), err.status_code())
    }

    pub fn failure(message: impl Into<String>, status: u16) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            status: Some(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let json = serde_json::to_value(Envelope::ok(42).with_message("done")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "success": true, "data": 42, "message": "done" })
        );
    }

    #[test]
    fn test_error_envelope_shape() {
        let json = serde_json::to_value(Envelope::error(&AppError::PermissionDenied)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": false,
                "message": "You do not have permission to perform this action",
                "status": 403
            })
        );
    }
}
