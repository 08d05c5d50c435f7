//! MPD -> HLS. The master playlist lists one variant per video representation (audio ones become
//! an `EXT-X-MEDIA` group), each media playlist is generated from whatever segment addressing the
//! representation uses.
use std::fmt::Write as _;

use regex::Captures;
use url::Url;

use crate::manifest::TEMPLATE_IDENTIFIER;
use crate::manifest::mpd::{
    AdaptationSet, Mpd, MpdError, Period, Representation, SegmentList, SegmentTemplate,
};

const AUDIO_GROUP: &str = "audio";

/// upper bound on segments per media playlist, upstream controls counts and repeats
pub const MAX_PLAYLIST_SEGMENTS: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Video,
    Audio,
    Other,
}

fn media_kind(set: &AdaptationSet, rep: &Representation) -> MediaKind {
    let mime = rep
        .mime_type
        .as_deref()
        .or(set.mime_type.as_deref())
        .or(set.content_type.as_deref())
        .unwrap_or("");

    if mime.starts_with("video") || rep.width.is_some() {
        MediaKind::Video
    } else if mime.starts_with("audio") {
        MediaKind::Audio
    } else {
        MediaKind::Other
    }
}

fn codecs<'a>(set: &'a AdaptationSet, rep: &'a Representation) -> Option<&'a str> {
    rep.codecs.as_deref().or(set.codecs.as_deref())
}

/// Builds the master playlist from the first period. `variant_uri` maps a representation id to the
/// uri the player should request for that representation's media playlist.
pub fn master_playlist<F>(mpd: &Mpd, mut variant_uri: F) -> String
where
    F: FnMut(&str) -> String,
{
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-INDEPENDENT-SEGMENTS\n");

    let Some(period) = mpd.periods.first() else {
        return out;
    };

    let mut video = Vec::new();
    let mut audio = Vec::new();
    for set in &period.adaptation_sets {
        for rep in &set.representations {
            match media_kind(set, rep) {
                MediaKind::Video => video.push((set, rep)),
                MediaKind::Audio => audio.push((set, rep)),
                MediaKind::Other => {}
            }
        }
    }

    // audio only presentations just get their audio renditions as variants
    if video.is_empty() {
        for (set, rep) in &audio {
            write_stream_inf(&mut out, set, rep, None, None);
            out.push_str(&variant_uri(&rep.id));
            out.push('\n');
        }
        return out;
    }

    for (index, (set, rep)) in audio.iter().enumerate() {
        let name = set.lang.as_deref().unwrap_or(&rep.id);
        let _ = write!(
            out,
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{}\",NAME=\"{}\",",
            AUDIO_GROUP,
            quoted_safe(name)
        );
        if let Some(lang) = set.lang.as_deref() {
            let _ = write!(out, "LANGUAGE=\"{}\",", quoted_safe(lang));
        }
        let _ = writeln!(
            out,
            "DEFAULT={},AUTOSELECT=YES,URI=\"{}\"",
            if index == 0 { "YES" } else { "NO" },
            variant_uri(&rep.id)
        );
    }

    let audio_codec = audio.first().and_then(|(set, rep)| codecs(set, rep));
    let audio_bandwidth = audio.first().map(|(_, rep)| rep.bandwidth).unwrap_or(0);
    let audio_group = (!audio.is_empty()).then_some(AUDIO_GROUP);

    for (set, rep) in &video {
        write_stream_inf(
            &mut out,
            set,
            rep,
            audio_group.map(|group| (group, audio_bandwidth)),
            audio_codec,
        );
        out.push_str(&variant_uri(&rep.id));
        out.push('\n');
    }

    out
}

fn write_stream_inf(
    out: &mut String,
    set: &AdaptationSet,
    rep: &Representation,
    audio_group: Option<(&str, u64)>,
    audio_codec: Option<&str>,
) {
    let bandwidth = rep.bandwidth + audio_group.map(|(_, bw)| bw).unwrap_or(0);
    let _ = write!(out, "#EXT-X-STREAM-INF:BANDWIDTH={}", bandwidth);

    if let (Some(width), Some(height)) = (rep.width, rep.height) {
        let _ = write!(out, ",RESOLUTION={}x{}", width, height);
    }

    let codec_list: Vec<&str> = codecs(set, rep).into_iter().chain(audio_codec).collect();
    if !codec_list.is_empty() {
        let _ = write!(out, ",CODECS=\"{}\"", quoted_safe(&codec_list.join(",")));
    }

    if let Some((group, _)) = audio_group {
        let _ = write!(out, ",AUDIO=\"{}\"", group);
    }

    out.push('\n');
}

// quoted-string attributes can't carry double quotes or line breaks
fn quoted_safe(value: &str) -> String {
    value.replace(['"', '\n', '\r'], "")
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedSegment {
    url: String,
    duration: f64,
}

#[derive(Debug, Clone)]
struct PeriodPlan {
    init: Option<String>,
    media_sequence: u64,
    segments: Vec<PlannedSegment>,
}

/// Builds the media playlist of one representation. Every upstream url (segments and init) goes
/// through `locate`, which returns what the playlist should reference instead.
pub fn media_playlist<F>(
    mpd: &Mpd,
    manifest_url: &Url,
    representation_id: &str,
    mut locate: F,
) -> Result<String, MpdError>
where
    F: FnMut(&str) -> String,
{
    let mut plans = Vec::new();
    let mut planned = 0usize;

    for period in &mpd.periods {
        let found = period.adaptation_sets.iter().find_map(|set| {
            set.representations
                .iter()
                .find(|rep| rep.id == representation_id)
                .map(|rep| (set, rep))
        });

        if let Some((set, rep)) = found {
            let plan = plan_period(mpd, period, set, rep, manifest_url)?;
            planned += plan.segments.len();
            if planned > MAX_PLAYLIST_SEGMENTS {
                return Err(too_many_segments());
            }
            plans.push(plan);
        }
    }

    if plans.is_empty() {
        return Err(MpdError::RepresentationNotFound(
            representation_id.to_string(),
        ));
    }

    let target_duration = plans
        .iter()
        .flat_map(|plan| plan.segments.iter())
        .map(|segment| segment.duration)
        .fold(0.0_f64, f64::max)
        .ceil()
        .max(1.0) as u64;

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:7\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target_duration);
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", plans[0].media_sequence);
    if mpd.is_static() {
        out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    }

    let mut current_init: Option<String> = None;
    for (index, plan) in plans.iter().enumerate() {
        if index > 0 {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }

        if let Some(init) = &plan.init {
            if index == 0 || current_init.as_ref() != Some(init) {
                let _ = writeln!(out, "#EXT-X-MAP:URI=\"{}\"", locate(init));
            }
            current_init = Some(init.clone());
        }

        for segment in &plan.segments {
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration);
            out.push_str(&locate(&segment.url));
            out.push('\n');
        }
    }

    if mpd.is_static() {
        out.push_str("#EXT-X-ENDLIST\n");
    }

    Ok(out)
}

fn plan_period(
    mpd: &Mpd,
    period: &Period,
    set: &AdaptationSet,
    rep: &Representation,
    manifest_url: &Url,
) -> Result<PeriodPlan, MpdError> {
    let base = effective_base(
        manifest_url,
        [
            mpd.base_url.as_deref(),
            period.base_url.as_deref(),
            set.base_url.as_deref(),
            rep.base_url.as_deref(),
        ],
    )?;

    let period_duration = period.duration.or(mpd.media_presentation_duration);

    let template = [
        rep.segment_template.as_ref(),
        set.segment_template.as_ref(),
        period.segment_template.as_ref(),
    ]
    .into_iter()
    .flatten()
    .fold(None::<SegmentTemplate>, |merged, level| match merged {
        Some(child) => Some(child.inherit(level)),
        None => Some(level.clone()),
    });

    if let Some(template) = template.filter(|t| t.media.is_some()) {
        return plan_template(&template, rep, &base, period_duration);
    }

    if let Some(list) = rep.segment_list.as_ref().or(set.segment_list.as_ref()) {
        return plan_list(list, &base, period_duration);
    }

    // SegmentBase or a bare BaseURL, the whole resource is a single segment
    if rep.base_url.is_some() || set.base_url.is_some() {
        return Ok(PeriodPlan {
            init: None,
            media_sequence: 0,
            segments: vec![PlannedSegment {
                url: base.to_string(),
                duration: period_duration.unwrap_or(0.0),
            }],
        });
    }

    Err(MpdError::Unsupported(format!(
        "representation '{}' has no segment addressing",
        rep.id
    )))
}

fn effective_base<'a>(
    manifest_url: &Url,
    levels: impl IntoIterator<Item = Option<&'a str>>,
) -> Result<Url, MpdError> {
    levels
        .into_iter()
        .flatten()
        .try_fold(manifest_url.clone(), |base, level| {
            base.join(level)
                .map_err(|e| MpdError::InvalidUrl(format!("{}: {}", level, e)))
        })
}

fn resolve(base: &Url, reference: &str) -> Result<String, MpdError> {
    base.join(reference)
        .map(|url| url.to_string())
        .map_err(|e| MpdError::InvalidUrl(format!("{}: {}", reference, e)))
}

fn plan_template(
    template: &SegmentTemplate,
    rep: &Representation,
    base: &Url,
    period_duration: Option<f64>,
) -> Result<PeriodPlan, MpdError> {
    let media = template.media.as_deref().unwrap_or_default();
    let timescale = template.timescale.unwrap_or(1).max(1);
    let start_number = template.start_number.unwrap_or(1);
    let offset = template.presentation_time_offset.unwrap_or(0);

    let init = template
        .initialization
        .as_deref()
        .map(|init| resolve(base, &expand_template(init, rep, start_number, offset)))
        .transpose()?;

    let mut segments = Vec::new();

    if let Some(timeline) = template.timeline.as_deref() {
        let period_end = match period_duration {
            Some(d) => Some(checked_offset(offset, d * timescale as f64)?),
            None => None,
        };
        let mut time = offset;
        let mut number = start_number;

        for (index, entry) in timeline.iter().enumerate() {
            if let Some(t) = entry.t {
                time = t;
            }
            if entry.d == 0 {
                continue;
            }

            let repeats = if entry.r >= 0 {
                entry.r as u64
            } else {
                // open ended repeat, runs up to the next explicit start or the period end
                let until = match timeline.get(index + 1).and_then(|next| next.t).or(period_end) {
                    Some(until) => until,
                    None => checked(time.checked_add(entry.d))?,
                };
                until.saturating_sub(time).div_ceil(entry.d).saturating_sub(1)
            };

            for _ in 0..=repeats {
                if segments.len() >= MAX_PLAYLIST_SEGMENTS {
                    return Err(too_many_segments());
                }
                segments.push(PlannedSegment {
                    url: resolve(base, &expand_template(media, rep, number, time))?,
                    duration: entry.d as f64 / timescale as f64,
                });
                time = checked(time.checked_add(entry.d))?;
                number = checked(number.checked_add(1))?;
            }
        }
    } else {
        let duration = template.duration.filter(|d| *d > 0).ok_or_else(|| {
            MpdError::Unsupported("SegmentTemplate without duration or timeline".to_string())
        })?;
        let total = period_duration.ok_or_else(|| {
            MpdError::Unsupported(
                "SegmentTemplate without SegmentTimeline needs a presentation duration"
                    .to_string(),
            )
        })?;

        let segment_seconds = duration as f64 / timescale as f64;
        let count = (total / segment_seconds).ceil();
        if !count.is_finite() || count > MAX_PLAYLIST_SEGMENTS as f64 {
            return Err(too_many_segments());
        }
        let count = count.max(0.0) as u64;

        for index in 0..count {
            let remaining = total - index as f64 * segment_seconds;
            let number = checked(start_number.checked_add(index))?;
            let time = checked(
                index
                    .checked_mul(duration)
                    .and_then(|elapsed| offset.checked_add(elapsed)),
            )?;
            segments.push(PlannedSegment {
                url: resolve(base, &expand_template(media, rep, number, time))?,
                duration: segment_seconds.min(remaining),
            });
        }
    }

    Ok(PeriodPlan {
        init,
        media_sequence: start_number,
        segments,
    })
}

fn checked(value: Option<u64>) -> Result<u64, MpdError> {
    value.ok_or_else(|| MpdError::Malformed("segment time or number out of range".to_string()))
}

fn checked_offset(offset: u64, ticks: f64) -> Result<u64, MpdError> {
    let ticks = ticks.round();
    if !ticks.is_finite() || ticks < 0.0 || ticks >= u64::MAX as f64 {
        return Err(MpdError::Malformed("period duration out of range".to_string()));
    }
    checked(offset.checked_add(ticks as u64))
}

fn too_many_segments() -> MpdError {
    MpdError::Unsupported(format!(
        "more than {} segments in one playlist",
        MAX_PLAYLIST_SEGMENTS
    ))
}

fn plan_list(
    list: &SegmentList,
    base: &Url,
    period_duration: Option<f64>,
) -> Result<PeriodPlan, MpdError> {
    let timescale = list.timescale.unwrap_or(1).max(1);
    let segment_seconds = match list.duration {
        Some(duration) => duration as f64 / timescale as f64,
        None => period_duration.unwrap_or(0.0) / list.segments.len().max(1) as f64,
    };

    let segments = list
        .segments
        .iter()
        .map(|media| {
            Ok(PlannedSegment {
                url: resolve(base, media)?,
                duration: segment_seconds,
            })
        })
        .collect::<Result<Vec<_>, MpdError>>()?;

    Ok(PeriodPlan {
        init: list
            .initialization
            .as_deref()
            .map(|init| resolve(base, init))
            .transpose()?,
        media_sequence: 1,
        segments,
    })
}

/// expands $RepresentationID$, $Number$, $Time$, $Bandwidth$ (with optional %0Nd width) and $$
pub fn expand_template(template: &str, rep: &Representation, number: u64, time: u64) -> String {
    TEMPLATE_IDENTIFIER
        .replace_all(template, |caps: &Captures| {
            let Some(identifier) = caps.get(1) else {
                return "$".to_string();
            };
            let width: usize = caps
                .get(2)
                .and_then(|w| w.as_str().parse().ok())
                .unwrap_or(0);

            match identifier.as_str() {
                "RepresentationID" => rep.id.clone(),
                "Number" => format!("{:0width$}", number, width = width),
                "Time" => format!("{:0width$}", time, width = width),
                "Bandwidth" => format!("{:0width$}", rep.bandwidth, width = width),
                // sub-segments aren't a thing in HLS, the whole segment is always number 1
                _ => format!("{:0width$}", 1, width = width),
            }
        })
        .into_owned()
}
