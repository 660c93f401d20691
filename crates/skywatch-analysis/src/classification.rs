use std::collections::BTreeMap;

use chrono::NaiveDate;
use skywatch_core::{ChangeClassification, classify_counts};
use skywatch_store::StoreReader;

use crate::AnalysisError;

/// Classifies `day` against the closest earlier day with counters. `None`
/// when either side is missing.
pub fn classify_day(
    reader: &StoreReader<'_>,
    day: NaiveDate,
) -> Result<Option<ChangeClassification>, AnalysisError> {
    let Some(current) = reader.count_observation(day)? else {
        return Ok(None);
    };
    let Some(previous) = reader.previous_count_observation(day)? else {
        return Ok(None);
    };

    Ok(Some(classify_counts(&previous, &current)))
}

/// Memoizing wrapper used while walking event lists, where many events share a day.
pub(crate) struct DayClassifier<'reader, 'conn> {
    reader: &'reader StoreReader<'conn>,
    cache: BTreeMap<NaiveDate, Option<ChangeClassification>>,
}

impl<'reader, 'conn> DayClassifier<'reader, 'conn> {
    pub(crate) fn new(reader: &'reader StoreReader<'conn>) -> Self {
        Self {
            reader,
            cache: BTreeMap::new(),
        }
    }

    pub(crate) fn classify(
        &mut self,
        day: NaiveDate,
    ) -> Result<Option<ChangeClassification>, AnalysisError> {
        if let Some(cached) = self.cache.get(&day) {
            return Ok(*cached);
        }
        let classification = classify_day(self.reader, day)?;
        self.cache.insert(day, classification);
        Ok(classification)
    }
}
