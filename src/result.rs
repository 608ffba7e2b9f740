//! Calculation statuses and the finished-measurement record.
//!
//! [`CalculationResult::to_xml`] renders the document returned to HTTP callers:
//!
//! ```text
//! <?xml version="1.0" encoding="utf-8"?>
//! <calculationResult>
//!   <barcode>..</barcode>
//!   <weight>1.250</weight>      (kilograms, three decimals)
//!   <length>..</length>
//!   <width>..</width>
//!   <height>..</height>
//!   <units>..</units>
//!   <comment>..</comment>
//!   <photo width=".." height=".." bpp="..">base64</photo>   (only when requested)
//! </calculationResult>
//! ```

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::AppResult;
use crate::stream::ColorImage;

/// Lifecycle and outcome of a station measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CalculationStatus {
    /// Nothing happened yet (station idle)
    #[default]
    Undefined,
    /// Waiting for the trigger to fire
    Pending,
    /// Capture running
    InProgress,
    /// Dimensions measured
    Successful,
    /// No valid sample could be aggregated
    CalculationError,
    /// The algorithm boundary refused every algorithm
    FailedToSelectAlgorithm,
    /// Nothing on the work area
    ObjectNotFound,
    /// Frames or the HTTP caller did not arrive in time
    TimedOut,
    /// Operator cancelled the measurement
    AbortedByUser,
    /// Could not start (busy or frame collection failed)
    FailedToStart,
    /// Barcode required but missing
    BarcodeNotEntered,
    /// Scale not settled
    WeightNotStable,
}

impl CalculationStatus {
    /// True once the measurement can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            CalculationStatus::Undefined | CalculationStatus::Pending | CalculationStatus::InProgress
        )
    }

    /// True for every terminal status except `Successful`.
    pub fn is_error(self) -> bool {
        self.is_terminal() && self != CalculationStatus::Successful
    }

    /// Dashboard status code: 0 ready, 1 running, 2 error.
    pub fn dashboard_code(self) -> u8 {
        match self {
            CalculationStatus::Undefined | CalculationStatus::Successful => 0,
            CalculationStatus::Pending | CalculationStatus::InProgress => 1,
            _ => 2,
        }
    }

    /// Operator-facing description.
    pub fn describe(self) -> &'static str {
        match self {
            CalculationStatus::Undefined => "Ready",
            CalculationStatus::Pending => "Measurement pending",
            CalculationStatus::InProgress => "Measurement in progress",
            CalculationStatus::Successful => "Measurement finished",
            CalculationStatus::CalculationError => "Calculation error",
            CalculationStatus::FailedToSelectAlgorithm => "Failed to select an algorithm",
            CalculationStatus::ObjectNotFound => "Object not found",
            CalculationStatus::TimedOut => "Measurement timed out",
            CalculationStatus::AbortedByUser => "Measurement aborted",
            CalculationStatus::FailedToStart => "Failed to start the measurement",
            CalculationStatus::BarcodeNotEntered => "Barcode was not entered",
            CalculationStatus::WeightNotStable => "Weight is not stable",
        }
    }
}

/// One finished measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    /// Object barcode (may be empty when not required)
    pub barcode: String,
    /// Weight in grams
    pub weight_g: f64,
    /// Length in millimetres
    pub length_mm: i32,
    /// Width in millimetres
    pub width_mm: i32,
    /// Height in millimetres
    pub height_mm: i32,
    /// Units on the pallet
    pub unit_count: u32,
    /// Free-form comment
    pub comment: String,
    /// Final status
    pub status: CalculationStatus,
    /// Start of the measurement
    pub timestamp: DateTime<Local>,
}

impl CalculationResult {
    /// Result carrying only a status, for measurements that never produced dimensions.
    pub fn failed(status: CalculationStatus, barcode: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            weight_g: 0.0,
            length_mm: 0,
            width_mm: 0,
            height_mm: 0,
            unit_count: 0,
            comment: String::new(),
            status,
            timestamp: Local::now(),
        }
    }

    /// Weight in kilograms.
    pub fn weight_kg(&self) -> f64 {
        self.weight_g / 1000.0
    }

    /// Volume in cubic millimetres.
    pub fn volume_mm3(&self) -> i64 {
        i64::from(self.length_mm) * i64::from(self.width_mm) * i64::from(self.height_mm)
    }

    /// Render the HTTP response document.
    ///
    /// # Errors
    ///
    /// `StationError::Document` when the XML writer fails.
    pub fn to_xml(&self) -> AppResult<String> {
        self.to_xml_with_photo(None)
    }

    /// Render the HTTP response document with an optional `<photo>` element carrying the
    /// base64 pixel buffer.
    ///
    /// # Errors
    ///
    /// `StationError::Document` when the XML writer fails.
    pub fn to_xml_with_photo(&self, photo: Option<&ColorImage>) -> AppResult<String> {
        let buffer = self.write_document(photo)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn write_document(&self, photo: Option<&ColorImage>) -> Result<Vec<u8>, quick_xml::Error> {
        let weight = if self.weight_g.is_finite() {
            format!("{:.3}", self.weight_kg())
        } else {
            String::from("NaN")
        };

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
        writer.write_event(Event::Start(BytesStart::new("calculationResult")))?;

        let fields = [
            ("barcode", self.barcode.clone()),
            ("weight", weight),
            ("length", self.length_mm.to_string()),
            ("width", self.width_mm.to_string()),
            ("height", self.height_mm.to_string()),
            ("units", self.unit_count.to_string()),
            ("comment", self.comment.clone()),
        ];
        for (tag, value) in &fields {
            writer.write_event(Event::Start(BytesStart::new(*tag)))?;
            writer.write_event(Event::Text(BytesText::new(value)))?;
            writer.write_event(Event::End(BytesEnd::new(*tag)))?;
        }

        if let Some(photo) = photo {
            let width = photo.width.to_string();
            let height = photo.height.to_string();
            let bpp = photo.bytes_per_pixel.to_string();
            let element = BytesStart::new("photo").with_attributes([
                ("width", width.as_str()),
                ("height", height.as_str()),
                ("bpp", bpp.as_str()),
            ]);
            writer.write_event(Event::Start(element))?;
            writer.write_event(Event::Text(BytesText::new(&STANDARD.encode(&photo.data))))?;
            writer.write_event(Event::End(BytesEnd::new("photo")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("calculationResult")))?;
        Ok(writer.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CalculationResult {
        CalculationResult {
            barcode: "4607001234567".into(),
            weight_g: 1250.0,
            length_mm: 400,
            width_mm: 300,
            height_mm: 200,
            unit_count: 1,
            comment: String::new(),
            status: CalculationStatus::Successful,
            timestamp: Local::now(),
        }
    }

    #[test]
    fn test_dashboard_codes() {
        assert_eq!(CalculationStatus::Undefined.dashboard_code(), 0);
        assert_eq!(CalculationStatus::Successful.dashboard_code(), 0);
        assert_eq!(CalculationStatus::InProgress.dashboard_code(), 1);
        assert_eq!(CalculationStatus::Pending.dashboard_code(), 1);
        assert_eq!(CalculationStatus::TimedOut.dashboard_code(), 2);
        assert_eq!(CalculationStatus::WeightNotStable.dashboard_code(), 2);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CalculationStatus::InProgress.is_terminal());
        assert!(CalculationStatus::Successful.is_terminal());
        assert!(!CalculationStatus::Successful.is_error());
        assert!(CalculationStatus::AbortedByUser.is_error());
    }

    #[test]
    fn test_xml_document() {
        let xml = sample().to_xml().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\""));
        assert!(xml.contains("<barcode>4607001234567</barcode>"));
        assert!(xml.contains("<weight>1.250</weight>"));
        assert!(xml.contains("<length>400</length>"));
        assert!(xml.contains("<width>300</width>"));
        assert!(xml.contains("<height>200</height>"));
        assert!(xml.contains("<units>1</units>"));
        assert!(xml.contains("<comment></comment>"));
        assert!(xml.trim_end().ends_with("</calculationResult>"));
    }

    #[test]
    fn test_xml_escaping() {
        let mut result = sample();
        result.comment = "fragile <glass> & \"ceramics\"".into();
        let xml = result.to_xml().unwrap();
        assert!(xml.contains("<comment>fragile &lt;glass&gt; &amp; "));
        assert!(!xml.contains("<glass>"));
        assert!(!xml.contains("<photo"));
    }

    #[test]
    fn test_xml_photo_element() {
        let photo = ColorImage::filled(2, 1, [1, 2, 3]);
        let xml = sample().to_xml_with_photo(Some(&photo)).unwrap();
        let encoded = STANDARD.encode(&photo.data);
        assert!(xml.contains(&format!(
            "<photo width=\"2\" height=\"1\" bpp=\"{}\">{encoded}</photo>",
            photo.bytes_per_pixel
        )));
        let photo_at = xml.find("<photo").unwrap();
        assert!(photo_at > xml.find("</comment>").unwrap());
        assert!(xml.trim_end().ends_with("</calculationResult>"));
    }

    #[test]
    fn test_overload_weight_is_nan() {
        let mut result = sample();
        result.weight_g = f64::NAN;
        assert!(result.to_xml().unwrap().contains("<weight>NaN</weight>"));
    }

    #[test]
    fn test_volume() {
        assert_eq!(sample().volume_mm3(), 24_000_000);
        assert_eq!(CalculationResult::failed(CalculationStatus::TimedOut, "x").volume_mm3(), 0);
    }
}
