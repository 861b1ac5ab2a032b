use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_block(block: &AvailabilityBlock) -> Result<(), EngineError> {
    if block.start >= block.end {
        return Err(EngineError::Validation(format!(
            "block {} ends before it starts",
            block.id
        )));
    }
    if let Some(until) = block.effective_until
        && until < block.effective_from
    {
        return Err(EngineError::Validation(format!(
            "block {} effective_until precedes effective_from",
            block.id
        )));
    }
    if block.timezone.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone label too long"));
    }
    Ok(())
}

pub(super) fn validate_preference_rows(rows: &[StudentPreference]) -> Result<(), EngineError> {
    if rows.len() > MAX_PREFERENCE_ROWS {
        return Err(EngineError::LimitExceeded("too many preference rows"));
    }
    for row in rows {
        if let PreferenceWindow::Hours(hours) = &row.window {
            if hours.is_empty() {
                return Err(EngineError::Validation(format!("preference {} has no hours", row.id)));
            }
            if let Some(h) = hours.iter().find(|h| **h > 23) {
                return Err(EngineError::Validation(format!("hour {h} out of range")));
            }
        }
    }
    Ok(())
}

fn validate_module_preference(p: &ModulePreference) -> Result<(), EngineError> {
    if p.slot_length_minutes == 0 || p.slot_length_minutes > MAX_SLOT_LENGTH_MINUTES {
        return Err(EngineError::Validation("slot length out of range".into()));
    }
    if p.buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::Validation("buffer out of range".into()));
    }
    if p.booking_window_days == 0 || p.booking_window_days > MAX_BOOKING_WINDOW_DAYS {
        return Err(EngineError::Validation("booking window out of range".into()));
    }
    if p.max_sessions_per_day == 0 || p.max_sessions_per_day > MAX_SESSIONS_PER_DAY {
        return Err(EngineError::Validation("max sessions per day out of range".into()));
    }
    Ok(())
}

impl Engine {
    pub async fn add_availability_block(&self, block: AvailabilityBlock) -> Result<(), EngineError> {
        validate_block(&block)?;
        let cal = self.store.calendar(block.tutor_id);
        let mut guard = cal.write().await;
        let existing = self.store.blocks_of(block.tutor_id);
        if existing.len() >= MAX_BLOCKS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many availability blocks"));
        }
        if existing.iter().any(|b| b.id == block.id) {
            return Err(EngineError::Validation(format!("block {} already exists", block.id)));
        }
        let event = Event::BlockAdded { block };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Swap the tutor's whole weekly schedule in one record.
    pub async fn replace_availability_blocks(
        &self,
        tutor_id: Ulid,
        blocks: Vec<AvailabilityBlock>,
    ) -> Result<(), EngineError> {
        if blocks.len() > MAX_BLOCKS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many availability blocks"));
        }
        for block in &blocks {
            if block.tutor_id != tutor_id {
                return Err(EngineError::Validation(format!(
                    "block {} belongs to another tutor",
                    block.id
                )));
            }
            validate_block(block)?;
        }
        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        let event = Event::BlocksReplaced { tutor_id, blocks };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_availability_block(&self, tutor_id: Ulid, id: Ulid) -> Result<(), EngineError> {
        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        if !self.store.blocks_of(tutor_id).iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BlockRemoved { id, tutor_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn add_availability_exception(
        &self,
        exception: AvailabilityException,
    ) -> Result<(), EngineError> {
        if exception.start.is_some() != exception.end.is_some() {
            return Err(EngineError::Validation(
                "exception start and end must be given together".into(),
            ));
        }
        if let Some((start, end)) = exception.time_range()
            && start >= end
        {
            return Err(EngineError::Validation("exception ends before it starts".into()));
        }
        if exception.kind == ExceptionKind::Addition
            && exception.time_range().is_none()
            && exception.block_id.is_none()
        {
            return Err(EngineError::Validation(
                "an addition needs a time range or a block".into(),
            ));
        }
        if exception.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let cal = self.store.calendar(exception.tutor_id);
        let mut guard = cal.write().await;
        if let Some(block_id) = exception.block_id
            && !self
                .store
                .blocks_of(exception.tutor_id)
                .iter()
                .any(|b| b.id == block_id)
        {
            return Err(EngineError::NotFound(block_id));
        }
        if self.store.exceptions_of(exception.tutor_id).len() >= MAX_EXCEPTIONS_PER_TUTOR {
            return Err(EngineError::LimitExceeded("too many availability exceptions"));
        }
        let event = Event::ExceptionAdded { exception };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn remove_availability_exception(
        &self,
        tutor_id: Ulid,
        id: Ulid,
    ) -> Result<(), EngineError> {
        let cal = self.store.calendar(tutor_id);
        let mut guard = cal.write().await;
        if !self.store.exceptions_of(tutor_id).iter().any(|e| e.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::ExceptionRemoved { id, tutor_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    pub async fn set_module_preference(&self, preference: ModulePreference) -> Result<(), EngineError> {
        validate_module_preference(&preference)?;
        let cal = self.store.calendar(preference.tutor_id);
        let mut guard = cal.write().await;
        let event = Event::ModulePreferenceSet { preference };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Replace the student's preference rows for one scope: general
    /// (`booking_request_id = None`) or one negotiation's snapshot.
    pub async fn save_student_preferences(
        &self,
        student_id: Ulid,
        booking_request_id: Option<Ulid>,
        rows: Vec<StudentPreference>,
    ) -> Result<(), EngineError> {
        validate_preference_rows(&rows)?;
        if let Some(request_id) = booking_request_id {
            match self.store.requests.get(&request_id) {
                Some(r) if r.student_id == student_id => {}
                _ => return Err(EngineError::NotFound(request_id)),
            }
        }
        let rows = rows
            .into_iter()
            .map(|row| StudentPreference {
                student_id,
                booking_request_id,
                ..row
            })
            .collect();
        let event = Event::StudentPreferencesSaved {
            student_id,
            booking_request_id,
            rows,
        };
        self.persist_unscoped(&event).await
    }
}
