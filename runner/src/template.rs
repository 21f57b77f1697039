use itertools::Itertools;
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while},
    character::complete::satisfy,
    combinator::{map, recognize, value},
    sequence::{delimited, pair, preceded},
    IResult,
};
use std::{collections::BTreeMap, str::FromStr};
use thiserror::Error;

/// Job script of the flood model runs, one watershed folder per job
pub const DEFAULT_TEMPLATE: &str = r#"#!/bin/bash

#SBATCH --job-name $job_name
#SBATCH --partition $partition
#SBATCH --nodes=1
#SBATCH -o $log_file_path

cd /data

export GCS_PATH=$gcs_path
echo "Copying remote data from $$GCS_PATH"
/snap/google-cloud-cli/current/bin/gsutil -m cp -r $$GCS_PATH .

cd $folder_name/

~/flood_model/build/lisflood $parameter_file

/snap/google-cloud-cli/current/bin/gsutil -m cp -r ${project_prefix}_results_$folder_name $$GCS_PATH
"#;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Invalid placeholder at byte {offset}")]
    InvalidPlaceholder { offset: usize },
    #[error("No value for placeholder `{placeholder}`")]
    Unresolved { placeholder: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Text with `$name` or `${name}` placeholders, `$$` is a literal `$`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part<'a> {
    Verbatim(&'a str),
    Placeholder(&'a str),
}

type ParseResult<'a, T> = IResult<&'a str, T>;

fn parse_identifier(input: &str) -> ParseResult<&str> {
    recognize(pair(
        satisfy(|c| c == '_' || c.is_ascii_alphabetic()),
        take_while(|c: char| c == '_' || c.is_ascii_alphanumeric()),
    ))(input)
}

fn parse_placeholder(input: &str) -> ParseResult<&str> {
    preceded(
        tag("$"),
        alt((delimited(tag("{"), parse_identifier, tag("}")), parse_identifier)),
    )(input)
}

fn parse_part(input: &str) -> ParseResult<Part> {
    alt((
        value(Part::Verbatim("$"), tag("$$")),
        map(parse_placeholder, Part::Placeholder),
        map(is_not("$"), Part::Verbatim),
    ))(input)
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut input = source;

        while !input.is_empty() {
            let (rest, part) = parse_part(input).map_err(|_| TemplateError::InvalidPlaceholder {
                offset: source.len() - input.len(),
            })?;

            match part {
                Part::Verbatim(text) => match segments.last_mut() {
                    Some(Segment::Literal(literal)) => literal.push_str(text),
                    _ => segments.push(Segment::Literal(text.to_owned())),
                },
                Part::Placeholder(name) => segments.push(Segment::Placeholder(name.to_owned())),
            }
            input = rest;
        }

        Ok(Self { segments })
    }

    /// distinct placeholder names in order of first appearance
    pub fn placeholders(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .unique()
            .collect()
    }

    /// replace every placeholder, failing on the first one without a value
    pub fn substitute(&self, values: &BTreeMap<&str, String>) -> Result<String, TemplateError> {
        let mut output = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Placeholder(name) => match values.get(name.as_str()) {
                    Some(value) => output.push_str(value),
                    None => {
                        return Err(TemplateError::Unresolved {
                            placeholder: name.clone(),
                        })
                    }
                },
            }
        }

        Ok(output)
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}
