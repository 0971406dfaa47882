// ─────────────────────────────────────────────────────────────────────
// VE Calibration Kernel — Log Dialects
// ─────────────────────────────────────────────────────────────────────
//! Vendor log dialects, each a small strategy that maps header names to
//! the columns a [`SensorRecord`](vecal_types::SensorRecord) needs.
//!
//! Header names are compared after normalisation (lowercase, whitespace
//! and underscores removed). Each role first tries an exact alias match,
//! then a substring match against the columns not yet claimed. The
//! dialect whose required roles all resolve with the highest score wins;
//! ties go to the earlier, more specific dialect.

use vecal_types::{Bank, VecalError, VecalResult, BANK_COUNT};

/// What a column means to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Rpm,
    MapKpa,
    Torque,
    Horsepower,
    /// One commanded AFR shared by every bank.
    TargetAfr,
    CommandedAfr(Bank),
    MeasuredAfr(Bank),
    KnockRetard,
    IntakeTemp,
    Throttle,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Rpm => "rpm",
            Role::MapKpa => "map_kpa",
            Role::Torque => "torque",
            Role::Horsepower => "horsepower",
            Role::TargetAfr => "afr_target",
            Role::CommandedAfr(Bank::Front) => "afr_commanded_front",
            Role::CommandedAfr(Bank::Rear) => "afr_commanded_rear",
            Role::MeasuredAfr(Bank::Front) => "afr_measured_front",
            Role::MeasuredAfr(Bank::Rear) => "afr_measured_rear",
            Role::KnockRetard => "knock_retard",
            Role::IntakeTemp => "iat",
            Role::Throttle => "tps",
        }
    }
}

/// One role a dialect looks for, with its normalised header aliases in
/// priority order.
#[derive(Debug, Clone, Copy)]
pub struct RoleSpec {
    pub role: Role,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

const fn required(role: Role, aliases: &'static [&'static str]) -> RoleSpec {
    RoleSpec {
        role,
        aliases,
        required: true,
    }
}

const fn optional(role: Role, aliases: &'static [&'static str]) -> RoleSpec {
    RoleSpec {
        role,
        aliases,
        required: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Torque,
    Horsepower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AfrColumns {
    pub commanded: usize,
    pub measured: usize,
}

/// Column indices for every field a record is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub dialect: &'static str,
    pub width: usize,
    pub rpm: usize,
    pub map_kpa: usize,
    pub load: (LoadKind, usize),
    pub afr: [Option<AfrColumns>; BANK_COUNT],
    pub knock_retard: Option<usize>,
    pub iat: Option<usize>,
    pub tps: Option<usize>,
}

impl ColumnMap {
    pub fn banks(&self) -> impl Iterator<Item = Bank> + '_ {
        Bank::ALL
            .into_iter()
            .filter(|b| self.afr[b.index()].is_some())
    }
}

/// Role → column assignment produced by header matching.
#[derive(Debug, Clone, Default)]
pub struct ResolvedColumns {
    slots: Vec<(Role, usize)>,
}

impl ResolvedColumns {
    pub fn get(&self, role: Role) -> Option<usize> {
        self.slots.iter().find(|(r, _)| *r == role).map(|(_, i)| *i)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Lowercase, with whitespace and underscores removed.
pub fn normalize_header(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Assign columns to roles. Exact alias matches are claimed first so a
/// loose alias such as `afr` cannot steal a column another role names
/// precisely.
pub fn resolve_roles(normalized: &[String], specs: &[RoleSpec]) -> ResolvedColumns {
    let mut used = vec![false; normalized.len()];
    let mut slots: Vec<(Role, usize)> = Vec::new();

    for spec in specs {
        let hit = spec.aliases.iter().find_map(|alias| {
            (0..normalized.len()).find(|&i| !used[i] && normalized[i] == *alias)
        });
        if let Some(i) = hit {
            used[i] = true;
            slots.push((spec.role, i));
        }
    }
    for spec in specs {
        if slots.iter().any(|(r, _)| *r == spec.role) {
            continue;
        }
        let hit = spec.aliases.iter().find_map(|alias| {
            (0..normalized.len()).find(|&i| !used[i] && normalized[i].contains(alias))
        });
        if let Some(i) = hit {
            used[i] = true;
            slots.push((spec.role, i));
        }
    }
    ResolvedColumns { slots }
}

/// A vendor log layout.
pub trait LogDialect {
    fn name(&self) -> &'static str;

    fn roles(&self) -> &'static [RoleSpec];

    /// Build a column map, or `None` when a required column or at least
    /// one complete AFR pair is missing.
    fn assemble(&self, found: &ResolvedColumns, width: usize) -> Option<ColumnMap>;

    /// Required roles count double.
    fn score(&self, found: &ResolvedColumns) -> u32 {
        self.roles()
            .iter()
            .filter(|spec| found.get(spec.role).is_some())
            .map(|spec| if spec.required { 2 } else { 1 })
            .sum()
    }

    fn missing(&self, found: &ResolvedColumns, width: usize) -> Vec<String> {
        let mut missing: Vec<String> = self
            .roles()
            .iter()
            .filter(|spec| spec.required && found.get(spec.role).is_none())
            .map(|spec| spec.role.label().to_string())
            .collect();
        if missing.is_empty() && self.assemble(found, width).is_none() {
            missing.push("afr pair (commanded + measured, any bank)".to_string());
        }
        missing
    }
}

fn optional_columns(found: &ResolvedColumns) -> (Option<usize>, Option<usize>, Option<usize>) {
    (
        found.get(Role::KnockRetard),
        found.get(Role::IntakeTemp),
        found.get(Role::Throttle),
    )
}

// ── dyno-suite ──────────────────────────────────────────────────────

/// Chassis-dyno export: torque load, one AFR target, measured AFR per bank.
pub struct DynoSuite;

const DYNO_SUITE_ROLES: &[RoleSpec] = &[
    required(Role::Rpm, &["enginerpm", "rpm", "enginespeed"]),
    required(Role::MapKpa, &["mapkpa", "map", "manifoldpressure"]),
    required(Role::Torque, &["torqueftlb", "torque", "tq"]),
    required(
        Role::TargetAfr,
        &["afrtarget", "targetafr", "commandedafr", "afrcommanded", "afrcmd"],
    ),
    optional(Role::MeasuredAfr(Bank::Front), &["afrfront", "frontafr", "afr1"]),
    optional(Role::MeasuredAfr(Bank::Rear), &["afrrear", "rearafr", "afr2"]),
    optional(Role::KnockRetard, &["knockretard", "knock"]),
    optional(Role::IntakeTemp, &["iat", "intakeairtemp", "intaketemp"]),
    optional(Role::Throttle, &["tps", "throttle"]),
];

impl LogDialect for DynoSuite {
    fn name(&self) -> &'static str {
        "dyno-suite"
    }

    fn roles(&self) -> &'static [RoleSpec] {
        DYNO_SUITE_ROLES
    }

    fn assemble(&self, found: &ResolvedColumns, width: usize) -> Option<ColumnMap> {
        let target = found.get(Role::TargetAfr)?;
        let afr = Bank::ALL.map(|bank| {
            found
                .get(Role::MeasuredAfr(bank))
                .map(|measured| AfrColumns {
                    commanded: target,
                    measured,
                })
        });
        if afr.iter().all(Option::is_none) {
            return None;
        }
        let (knock_retard, iat, tps) = optional_columns(found);
        Some(ColumnMap {
            dialect: self.name(),
            width,
            rpm: found.get(Role::Rpm)?,
            map_kpa: found.get(Role::MapKpa)?,
            load: (LoadKind::Torque, found.get(Role::Torque)?),
            afr,
            knock_retard,
            iat,
            tps,
        })
    }
}

// ── ecu-logger ──────────────────────────────────────────────────────

/// ECU datalogger: horsepower load, commanded and measured AFR per bank.
pub struct EcuLogger;

const ECU_LOGGER_ROLES: &[RoleSpec] = &[
    required(Role::Rpm, &["rpm", "enginespeed"]),
    required(Role::MapKpa, &["mapkpa", "map", "manifoldabsolutepressure"]),
    required(Role::Horsepower, &["horsepower", "hp"]),
    optional(
        Role::CommandedAfr(Bank::Front),
        &["afrcmdfront", "afrcommandedfront", "commandedafrfront", "cmdafrfront"],
    ),
    optional(
        Role::MeasuredAfr(Bank::Front),
        &["afrmeasfront", "afrmeasuredfront", "measuredafrfront", "measafrfront"],
    ),
    optional(
        Role::CommandedAfr(Bank::Rear),
        &["afrcmdrear", "afrcommandedrear", "commandedafrrear", "cmdafrrear"],
    ),
    optional(
        Role::MeasuredAfr(Bank::Rear),
        &["afrmeasrear", "afrmeasuredrear", "measuredafrrear", "measafrrear"],
    ),
    optional(Role::KnockRetard, &["knockretard", "knock", "sparkretard"]),
    optional(Role::IntakeTemp, &["iat", "intakeairtemp", "intaketemp"]),
    optional(Role::Throttle, &["tps", "throttle"]),
];

impl LogDialect for EcuLogger {
    fn name(&self) -> &'static str {
        "ecu-logger"
    }

    fn roles(&self) -> &'static [RoleSpec] {
        ECU_LOGGER_ROLES
    }

    fn assemble(&self, found: &ResolvedColumns, width: usize) -> Option<ColumnMap> {
        let afr = Bank::ALL.map(|bank| {
            Some(AfrColumns {
                commanded: found.get(Role::CommandedAfr(bank))?,
                measured: found.get(Role::MeasuredAfr(bank))?,
            })
        });
        if afr.iter().all(Option::is_none) {
            return None;
        }
        let (knock_retard, iat, tps) = optional_columns(found);
        Some(ColumnMap {
            dialect: self.name(),
            width,
            rpm: found.get(Role::Rpm)?,
            map_kpa: found.get(Role::MapKpa)?,
            load: (LoadKind::Horsepower, found.get(Role::Horsepower)?),
            afr,
            knock_retard,
            iat,
            tps,
        })
    }
}

// ── generic ─────────────────────────────────────────────────────────

/// Minimal single-bank layout; load may be torque or horsepower.
pub struct GenericLog;

const GENERIC_ROLES: &[RoleSpec] = &[
    required(Role::Rpm, &["rpm"]),
    required(Role::MapKpa, &["map", "kpa"]),
    optional(Role::Torque, &["torque", "tq"]),
    optional(Role::Horsepower, &["horsepower", "hp", "power"]),
    required(
        Role::TargetAfr,
        &["afrtarget", "targetafr", "afrcmd", "commandedafr", "afrcommanded"],
    ),
    required(Role::MeasuredAfr(Bank::Front), &["afr", "afrmeas", "measuredafr"]),
    optional(Role::KnockRetard, &["knock"]),
    optional(Role::IntakeTemp, &["iat", "intaketemp"]),
    optional(Role::Throttle, &["tps", "throttle"]),
];

impl LogDialect for GenericLog {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn roles(&self) -> &'static [RoleSpec] {
        GENERIC_ROLES
    }

    fn assemble(&self, found: &ResolvedColumns, width: usize) -> Option<ColumnMap> {
        let load = match (found.get(Role::Torque), found.get(Role::Horsepower)) {
            (Some(i), _) => (LoadKind::Torque, i),
            (None, Some(i)) => (LoadKind::Horsepower, i),
            (None, None) => return None,
        };
        let front = AfrColumns {
            commanded: found.get(Role::TargetAfr)?,
            measured: found.get(Role::MeasuredAfr(Bank::Front))?,
        };
        let (knock_retard, iat, tps) = optional_columns(found);
        Some(ColumnMap {
            dialect: self.name(),
            width,
            rpm: found.get(Role::Rpm)?,
            map_kpa: found.get(Role::MapKpa)?,
            load,
            afr: [Some(front), None],
            knock_retard,
            iat,
            tps,
        })
    }

    fn missing(&self, found: &ResolvedColumns, width: usize) -> Vec<String> {
        let mut missing: Vec<String> = self
            .roles()
            .iter()
            .filter(|spec| spec.required && found.get(spec.role).is_none())
            .map(|spec| spec.role.label().to_string())
            .collect();
        if found.get(Role::Torque).is_none() && found.get(Role::Horsepower).is_none() {
            missing.push("torque or horsepower".to_string());
        }
        if missing.is_empty() && self.assemble(found, width).is_none() {
            missing.push("afr pair".to_string());
        }
        missing
    }
}

/// Candidate dialects, most specific first.
pub fn dialects() -> [&'static dyn LogDialect; 3] {
    [&DynoSuite, &EcuLogger, &GenericLog]
}

/// Choose the dialect for a header row and resolve its columns.
///
/// Fails with [`VecalError::MissingColumns`] naming the closest dialect,
/// the headers found, and the roles it could not resolve.
pub fn select_dialect(headers: &[String]) -> VecalResult<ColumnMap> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let width = headers.len();

    let mut best: Option<(u32, ColumnMap)> = None;
    let mut closest: Option<(u32, &'static dyn LogDialect, ResolvedColumns)> = None;

    for dialect in dialects() {
        let found = resolve_roles(&normalized, dialect.roles());
        let score = dialect.score(&found);
        log::debug!("dialect {} scored {score}", dialect.name());
        match dialect.assemble(&found, width) {
            Some(map) => {
                if best.as_ref().map_or(true, |(s, _)| score > *s) {
                    best = Some((score, map));
                }
            }
            None => {
                if closest.as_ref().map_or(true, |(s, _, _)| score > *s) {
                    closest = Some((score, dialect, found));
                }
            }
        }
    }

    if let Some((score, map)) = best {
        log::info!("log dialect: {} (score {score})", map.dialect);
        return Ok(map);
    }

    let (dialect, expected) = match closest {
        Some((_, dialect, found)) => (dialect.name(), dialect.missing(&found, width)),
        None => ("unknown", Vec::new()),
    };
    Err(VecalError::MissingColumns {
        dialect: dialect.to_string(),
        found: headers.to_vec(),
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(line: &str) -> Vec<String> {
        line.split(',').map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header(" Engine RPM "), "enginerpm");
        assert_eq!(normalize_header("AFR_Meas_Front"), "afrmeasfront");
        assert_eq!(normalize_header("MAP\t(kPa)"), "map(kpa)");
    }

    #[test]
    fn test_dyno_suite_selected() {
        let map = select_dialect(&headers(
            "Engine RPM,MAP kPa,Torque,AFR Target,AFR Front,AFR Rear,Knock Retard,IAT,TPS",
        ))
        .unwrap();
        assert_eq!(map.dialect, "dyno-suite");
        assert_eq!(map.rpm, 0);
        assert_eq!(map.map_kpa, 1);
        assert_eq!(map.load, (LoadKind::Torque, 2));
        assert_eq!(
            map.afr[Bank::Rear.index()],
            Some(AfrColumns {
                commanded: 3,
                measured: 5
            })
        );
        assert_eq!(map.knock_retard, Some(6));
        assert_eq!(map.tps, Some(8));
        assert_eq!(map.banks().count(), 2);
    }

    #[test]
    fn test_ecu_logger_selected() {
        let map = select_dialect(&headers(
            "RPM,MAP_kPa,HP,AFR_Cmd_Front,AFR_Meas_Front,AFR_Cmd_Rear,AFR_Meas_Rear,IAT",
        ))
        .unwrap();
        assert_eq!(map.dialect, "ecu-logger");
        assert_eq!(map.load, (LoadKind::Horsepower, 2));
        assert_eq!(
            map.afr[Bank::Front.index()],
            Some(AfrColumns {
                commanded: 3,
                measured: 4
            })
        );
        assert_eq!(map.iat, Some(7));
        assert_eq!(map.knock_retard, None);
    }

    #[test]
    fn test_generic_selected() {
        let map = select_dialect(&headers("rpm,map,torque,afr,afr_target")).unwrap();
        assert_eq!(map.dialect, "generic");
        assert_eq!(
            map.afr[Bank::Front.index()],
            Some(AfrColumns {
                commanded: 4,
                measured: 3
            })
        );
        assert_eq!(map.afr[Bank::Rear.index()], None);
    }

    #[test]
    fn test_exact_match_beats_substring() {
        // "afr" would substring-match "afrtarget"; the exact column wins.
        let map = select_dialect(&headers("AFR Target,rpm,map,hp,AFR")).unwrap();
        let front = map.afr[Bank::Front.index()].unwrap();
        assert_eq!(front.measured, 4);
        assert_eq!(front.commanded, 0);
    }

    #[test]
    fn test_missing_columns_reported() {
        let err = select_dialect(&headers("rpm,torque,afr,afr_target")).unwrap_err();
        match err {
            VecalError::MissingColumns {
                dialect,
                found,
                expected,
            } => {
                assert_eq!(dialect, "generic");
                assert_eq!(found.len(), 4);
                assert!(expected.iter().any(|e| e == "map_kpa"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_score_counts_required_double() {
        let normalized: Vec<String> = ["rpm", "map", "torque"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let found = resolve_roles(&normalized, DynoSuite.roles());
        assert_eq!(found.len(), 3);
        assert_eq!(DynoSuite.score(&found), 6);
        assert!(DynoSuite.assemble(&found, 3).is_none());
    }
}
