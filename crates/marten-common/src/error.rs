//! Error types for MartenDB.

use thiserror::Error;

/// Result type alias using MartenError.
pub type Result<T> = std::result::Result<T, MartenError>;

/// Errors that can occur in MartenDB operations.
#[derive(Debug, Error)]
pub enum MartenError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    // Paged file errors
    #[error("Page not found: {page_no} in file {file_id}")]
    PageNotFound { file_id: u32, page_no: u32 },

    #[error("Page size mismatch: file uses {actual}, build uses {expected}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("Bad file header: {0}")]
    BadFileHeader(String),

    // Buffer manager errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page {page_no} of file {file_id} is not pinned")]
    PageNotPinned { file_id: u32, page_no: u32 },

    #[error("File {0} is not registered with the buffer manager")]
    FileNotRegistered(u32),

    // Heap file errors
    #[error("Heap page full, unable to insert record")]
    PageFull,

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // Index errors
    #[error("Index metadata mismatch on {field}: expected {expected}, found {found}")]
    IndexMetadataMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // Scan errors
    #[error("Bad scan opcodes: low must be GT/GTE, high must be LT/LTE")]
    BadScanOpcodes,

    #[error("Bad scan range: low bound exceeds high bound")]
    BadScanRange,

    #[error("No key in the index satisfies the scan range")]
    NoSuchKeyFound,

    #[error("Scan not initialized")]
    ScanNotInitialized,

    #[error("Index scan completed")]
    IndexScanCompleted,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: MartenError = io_err.into();
        assert!(matches!(err, MartenError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_page_not_found_display() {
        let err = MartenError::PageNotFound {
            file_id: 3,
            page_no: 42,
        };
        assert_eq!(err.to_string(), "Page not found: 42 in file 3");
    }

    #[test]
    fn test_page_size_mismatch_display() {
        let err = MartenError::PageSizeMismatch {
            expected: 8192,
            actual: 4096,
        };
        assert_eq!(
            err.to_string(),
            "Page size mismatch: file uses 4096, build uses 8192"
        );
    }

    #[test]
    fn test_metadata_mismatch_display() {
        let err = MartenError::IndexMetadataMismatch {
            field: "attr_byte_offset",
            expected: "8".to_string(),
            found: "0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Index metadata mismatch on attr_byte_offset: expected 8, found 0"
        );
    }

    #[test]
    fn test_scan_errors_display() {
        assert_eq!(
            MartenError::BadScanOpcodes.to_string(),
            "Bad scan opcodes: low must be GT/GTE, high must be LT/LTE"
        );
        assert_eq!(
            MartenError::BadScanRange.to_string(),
            "Bad scan range: low bound exceeds high bound"
        );
        assert_eq!(
            MartenError::NoSuchKeyFound.to_string(),
            "No key in the index satisfies the scan range"
        );
        assert_eq!(
            MartenError::ScanNotInitialized.to_string(),
            "Scan not initialized"
        );
        assert_eq!(
            MartenError::IndexScanCompleted.to_string(),
            "Index scan completed"
        );
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = MartenError::TypeMismatch {
            expected: "INTEGER".to_string(),
            actual: "DOUBLE".to_string(),
        };
        assert_eq!(err.to_string(), "Type mismatch: expected INTEGER, got DOUBLE");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(7)
        }

        fn returns_err() -> Result<i32> {
            Err(MartenError::BufferPoolFull)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MartenError>();
    }
}
