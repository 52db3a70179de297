use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A laboratory or vital-sign value. Lab data is optional input: special
/// category clauses use it when present and are omitted otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Short test code such as `ALT`, `AST`, `WBC`, `ANC`, `WEIGHT`.
    pub test_code: String,
    pub value: f64,
    pub unit: String,
    pub upper_limit_normal: Option<f64>,
    pub collected_on: NaiveDate,
    pub baseline: bool,
}

impl Measurement {
    pub fn is_test(&self, code: &str) -> bool {
        self.test_code.eq_ignore_ascii_case(code)
    }

    /// Value expressed as a multiple of the upper limit of normal.
    pub fn uln_multiple(&self) -> Option<f64> {
        self.upper_limit_normal
            .filter(|uln| *uln > 0.0)
            .map(|uln| self.value / uln)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ast(value: f64, uln: Option<f64>) -> Measurement {
        Measurement {
            test_code: "AST".to_string(),
            value,
            unit: "U/L".to_string(),
            upper_limit_normal: uln,
            collected_on: NaiveDate::from_ymd_opt(2024, 3, 16).unwrap(),
            baseline: false,
        }
    }

    #[test]
    fn test_code_matches_case_insensitively() {
        assert!(ast(20.0, None).is_test("ast"));
        assert!(!ast(20.0, None).is_test("ALT"));
    }

    #[test]
    fn uln_multiple() {
        let m = ast(170.0, Some(34.0));
        assert!((m.uln_multiple().unwrap() - 5.0).abs() < f64::EPSILON);
        assert!(ast(170.0, None).uln_multiple().is_none());
        assert!(ast(170.0, Some(0.0)).uln_multiple().is_none());
    }
}
