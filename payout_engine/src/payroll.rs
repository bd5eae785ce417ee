//! Payroll computation engine.
//!
//! The `payroll` module turns approved timesheets into gross pay using
//! each employee's [`Compensation`] and the landlord's
//! [`PayrollSettings`].  Everything here is pure; settlement of the
//! resulting amounts happens in [`crate::payment`].  Batch previews use
//! the [`rayon`] crate to compute timesheets in parallel.

use crate::error::{PayoutError, Result};
use crate::fees::{FeeClass, FeeQuote, FeeSchedule};
use crate::models::{
    round_money, Compensation, Money, OvertimeRule, Payee, PayType, PayrollSettings, TimeEntry,
    Timesheet, WorkUnitRef,
};
use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Rejects settings outside the supported policy range.
pub fn validate_settings(settings: &PayrollSettings) -> Result<()> {
    if settings.overtime_multiplier < dec!(1.0) || settings.overtime_multiplier > dec!(3.0) {
        return Err(PayoutError::InvalidConfig(format!(
            "overtime multiplier {} must be between 1.0 and 3.0",
            settings.overtime_multiplier
        )));
    }
    let threshold = match settings.overtime_rule {
        OvertimeRule::Weekly(hours) | OvertimeRule::Daily(hours) => hours,
    };
    if threshold <= Decimal::ZERO {
        return Err(PayoutError::InvalidConfig(
            "overtime threshold must be positive".into(),
        ));
    }
    if settings.salary_hours_per_year <= Decimal::ZERO {
        return Err(PayoutError::InvalidConfig(
            "salary hours per year must be positive".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoursBreakdown {
    pub regular: Decimal,
    pub overtime: Decimal,
    pub total: Decimal,
}

/// Splits raw time entries into regular and overtime hours.
///
/// With a weekly rule, hours past the threshold within each ISO week are
/// overtime.  With a daily rule the threshold applies to each calendar
/// day, entries on the same date being summed first.
pub fn split_hours(entries: &[TimeEntry], rule: OvertimeRule) -> HoursBreakdown {
    let (threshold, buckets) = match rule {
        OvertimeRule::Weekly(threshold) => (threshold, bucket(entries, |d| {
            let week = d.iso_week();
            (week.year(), week.week())
        })),
        OvertimeRule::Daily(threshold) => (threshold, bucket(entries, |d| (d.year(), d.ordinal()))),
    };
    let mut regular = Decimal::ZERO;
    let mut overtime = Decimal::ZERO;
    for hours in buckets.into_values() {
        if hours > threshold {
            regular += threshold;
            overtime += hours - threshold;
        } else {
            regular += hours;
        }
    }
    HoursBreakdown {
        regular,
        overtime,
        total: regular + overtime,
    }
}

fn bucket(entries: &[TimeEntry], key: impl Fn(NaiveDate) -> (i32, u32)) -> BTreeMap<(i32, u32), Decimal> {
    let mut buckets = BTreeMap::new();
    for entry in entries {
        *buckets.entry(key(entry.date)).or_insert(Decimal::ZERO) += entry.hours;
    }
    buckets
}

/// Hours to pay for `timesheet`.  Raw entries, when present, are
/// re-split under the landlord's overtime rule; otherwise the totals
/// recorded on the timesheet are used as-is.
pub fn timesheet_hours(timesheet: &Timesheet, settings: &PayrollSettings) -> HoursBreakdown {
    if timesheet.entries.is_empty() {
        HoursBreakdown {
            regular: timesheet.regular_hours,
            overtime: timesheet.overtime_hours,
            total: timesheet.total_hours,
        }
    } else {
        split_hours(&timesheet.entries, settings.overtime_rule)
    }
}

/// Gross pay for one timesheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayCalculation {
    pub timesheet_id: Uuid,
    pub employee_id: Uuid,
    pub pay_type: PayType,
    pub hours: HoursBreakdown,
    /// Effective hourly rate (implied from the salary for salaried staff).
    pub hourly_rate: Money,
    pub overtime_rate: Money,
    pub regular_pay: Money,
    pub overtime_pay: Money,
    pub gross_amount: Money,
}

pub fn calculate_pay(
    compensation: &Compensation,
    timesheet: &Timesheet,
    settings: &PayrollSettings,
) -> Result<PayCalculation> {
    let employee_id = compensation.employee_id;
    let invalid = |reason: &str| PayoutError::InvalidCompensation {
        employee_id,
        reason: reason.to_string(),
    };
    let too_large = || invalid("pay exceeds the largest representable amount");
    let mul = |a: Decimal, b: Decimal| a.checked_mul(b).ok_or_else(too_large);
    let hours = timesheet_hours(timesheet, settings);

    let (hourly_rate, overtime_rate, regular_pay, overtime_pay) = match compensation.pay_type {
        PayType::Hourly => {
            let rate = compensation
                .hourly_rate
                .filter(|r| *r > Decimal::ZERO)
                .ok_or_else(|| invalid("hourly employee without a positive hourly rate"))?;
            let overtime_rate = match compensation.overtime_rate {
                Some(explicit) => explicit,
                None => mul(rate, settings.overtime_multiplier)?,
            };
            (
                rate,
                overtime_rate,
                mul(hours.regular, rate)?,
                mul(hours.overtime, overtime_rate)?,
            )
        }
        PayType::Salary => {
            let salary = compensation
                .salary_amount
                .filter(|s| *s > Decimal::ZERO)
                .ok_or_else(|| invalid("salaried employee without a positive salary"))?;
            let implied = salary
                .checked_div(settings.salary_hours_per_year)
                .ok_or_else(|| invalid("salary divisor must be positive"))?;
            (implied, implied, mul(hours.total, implied)?, Decimal::ZERO)
        }
    };
    let gross = regular_pay.checked_add(overtime_pay).ok_or_else(too_large)?;

    Ok(PayCalculation {
        timesheet_id: timesheet.id,
        employee_id,
        pay_type: compensation.pay_type,
        hours,
        hourly_rate: round_money(hourly_rate),
        overtime_rate: round_money(overtime_rate),
        regular_pay: round_money(regular_pay),
        overtime_pay: round_money(overtime_pay),
        gross_amount: round_money(gross),
    })
}

/// One payable timesheet in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollLine {
    pub calculation: PayCalculation,
    pub quote: FeeQuote,
    pub payee: Payee,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTimesheet {
    pub timesheet_id: Uuid,
    pub employee_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollPreview {
    pub lines: Vec<PayrollLine>,
    pub skipped: Vec<SkippedTimesheet>,
    pub total_gross: Money,
    pub total_fees: Money,
    pub total_net: Money,
}

/// Prices one approved timesheet: gross pay plus the team-payment fee.
pub fn price_timesheet(
    timesheet: &Timesheet,
    compensation: Option<&Compensation>,
    settings: &PayrollSettings,
    fees: &FeeSchedule,
) -> Result<PayrollLine> {
    let unit = WorkUnitRef::Timesheet(timesheet.id);
    if timesheet.status != unit.ready_status() {
        return Err(PayoutError::WorkUnitNotReady {
            work_unit: unit,
            status: timesheet.status,
            expected: unit.ready_status(),
        });
    }
    let compensation = compensation.ok_or(PayoutError::MissingCompensation {
        employee_id: timesheet.employee_id,
    })?;
    let calculation = calculate_pay(compensation, timesheet, settings)?;
    let quote = fees.quote(calculation.gross_amount, FeeClass::TeamPayment)?;
    Ok(PayrollLine {
        calculation,
        quote,
        payee: compensation.payee.clone(),
    })
}

/// Computes a batch without moving any money.
///
/// Timesheets that cannot be priced (no compensation record, unusable
/// rates, nothing to pay) are reported in `skipped` rather than failing
/// the whole preview.
pub fn preview_payroll(
    timesheets: Vec<Timesheet>,
    compensation: &HashMap<Uuid, Compensation>,
    settings: &PayrollSettings,
    fees: &FeeSchedule,
) -> PayrollPreview {
    let outcomes: Vec<std::result::Result<PayrollLine, SkippedTimesheet>> = timesheets
        .into_par_iter()
        .map(|timesheet| {
            price_timesheet(
                &timesheet,
                compensation.get(&timesheet.employee_id),
                settings,
                fees,
            )
            .map_err(|err| SkippedTimesheet {
                timesheet_id: timesheet.id,
                employee_id: timesheet.employee_id,
                reason: err.to_string(),
            })
        })
        .collect();

    let mut lines = Vec::new();
    let mut skipped = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(line) => lines.push(line),
            Err(skip) => skipped.push(skip),
        }
    }
    let total_gross = lines.iter().map(|l| l.quote.amount).sum();
    let total_fees = lines.iter().map(|l| l.quote.fee).sum();
    let total_net = lines.iter().map(|l| l.quote.net_amount).sum();
    PayrollPreview {
        lines,
        skipped,
        total_gross,
        total_fees,
        total_net,
    }
}
