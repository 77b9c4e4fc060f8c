use crate::domain::SpecialPeriod;
use crate::error::ConflictError;

/// Rejects special periods that would make precedence ambiguous for a
/// session type.
///
/// Time-based rates are not checked here; overlapping day/time rules are
/// resolved at read time by the largest-discount rule.
pub struct PeriodOverlapValidator;

impl PeriodOverlapValidator {
    /// Check `candidate` against `existing`, skipping inactive periods and the
    /// candidate's own previous version (same id) when updating.
    pub fn check(candidate: &SpecialPeriod, existing: &[SpecialPeriod]) -> Result<(), ConflictError> {
        if !candidate.is_active {
            return Ok(());
        }

        for other in existing {
            if other.id == candidate.id || !other.is_active {
                continue;
            }
            let Some(shared) = candidate.session_type_ids.first_shared(&other.session_type_ids)
            else {
                continue;
            };
            if candidate.date_range.overlaps(&other.date_range) {
                return Err(ConflictError::OverlappingPeriod {
                    candidate: candidate.id.to_string(),
                    existing: other.id.to_string(),
                    session_type: shared.to_string(),
                });
            }
        }
        Ok(())
    }
}
