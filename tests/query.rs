use assert_matches::assert_matches;

use nbia_fetch::domain::Granularity;
use nbia_fetch::error::NbiaError;
use nbia_fetch::normalize::Field;
use nbia_fetch::query::{Endpoint, FilterKey, PageCursor, QueryBuilder, SearchCriteria, Sort};

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

#[test]
fn build_keeps_exactly_the_given_filters() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::Collection, "TCGA-LUAD")
        .unwrap()
        .with(FilterKey::Modality, "CT")
        .unwrap();

    let request = QueryBuilder::build(Endpoint::Series, &criteria, 100, None).unwrap();
    assert_eq!(request.filters(), &criteria);
    assert_eq!(request.granularity(), Granularity::Series);
    assert_eq!(
        request.params(),
        &[
            ("Collection".to_string(), "TCGA-LUAD".to_string()),
            ("Modality".to_string(), "CT".to_string()),
        ]
    );
}

#[test]
fn build_refuses_unconstrained_queries() {
    let err = QueryBuilder::build(Endpoint::Series, &SearchCriteria::new(), 100, None).unwrap_err();
    assert_matches!(err, NbiaError::InvalidQuery(_));

    let only_modifier = SearchCriteria::new()
        .with(FilterKey::ModalityAnded, "true")
        .unwrap();
    let err = QueryBuilder::build(Endpoint::SimpleSearch, &only_modifier, 100, None).unwrap_err();
    assert_matches!(err, NbiaError::InvalidQuery(_));
}

#[test]
fn build_rejects_filters_the_endpoint_ignores() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::Collection, "LIDC-IDRI")
        .unwrap()
        .with(FilterKey::Manufacturer, "GE MEDICAL SYSTEMS")
        .unwrap();
    let err = QueryBuilder::build(Endpoint::Patients, &criteria, 100, None).unwrap_err();
    assert_matches!(
        err,
        NbiaError::UnsupportedFilter { filter, endpoint }
            if filter == "manufacturer" && endpoint == "getPatient"
    );
}

#[test]
fn build_requires_endpoint_specific_filters() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::Collection, "TCGA-KIRC")
        .unwrap();
    let err = QueryBuilder::build(Endpoint::NewPatients, &criteria, 100, None).unwrap_err();
    assert_matches!(err, NbiaError::InvalidQuery(message) if message.contains("fromDate"));
}

#[test]
fn unknown_keys_and_bad_values_fail_before_building() {
    assert_matches!(
        SearchCriteria::new().with_raw("scanner", "x"),
        Err(NbiaError::UnsupportedFilter { .. })
    );
    assert_matches!(
        SearchCriteria::new().with(FilterKey::SeriesInstanceUid, "not-a-uid"),
        Err(NbiaError::InvalidFilterValue { .. })
    );
    assert_matches!(
        SearchCriteria::new().with(FilterKey::MinStudies, "-1"),
        Err(NbiaError::InvalidFilterValue { .. })
    );
    assert_matches!(
        SearchCriteria::new().with(FilterKey::FromDate, "2020-13-40"),
        Err(NbiaError::InvalidFilterValue { .. })
    );
    assert_matches!(
        SearchCriteria::new().with(FilterKey::Species, "cat"),
        Err(NbiaError::InvalidFilterValue { .. })
    );
}

#[test]
fn single_valued_filters_cannot_repeat() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::FromDate, "2022/01/01")
        .unwrap();
    assert_matches!(
        criteria.with(FilterKey::FromDate, "2023/01/01"),
        Err(NbiaError::InvalidFilterValue { .. })
    );

    let repeated = SearchCriteria::new()
        .with(FilterKey::Modality, "CT")
        .unwrap()
        .with(FilterKey::Modality, "MR")
        .unwrap();
    assert_eq!(repeated.values(FilterKey::Modality).count(), 2);
}

#[test]
fn get_endpoints_take_one_value_per_parameter() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::Modality, "CT")
        .unwrap()
        .with(FilterKey::Modality, "MR")
        .unwrap();
    let err = QueryBuilder::build(Endpoint::Series, &criteria, 100, None).unwrap_err();
    assert_matches!(err, NbiaError::InvalidQuery(_));
}

#[test]
fn updated_series_dates_are_sent_month_first() {
    let criteria = SearchCriteria::new()
        .with_raw("fromDate", "2024/02/29")
        .unwrap();
    let request = QueryBuilder::build(Endpoint::UpdatedSeries, &criteria, 100, None).unwrap();
    assert_eq!(param(request.params(), "fromDate"), Some("02-29-2024"));
    assert!(!request.is_paged());
    assert_eq!(
        request.page_params(&PageCursor::Offset(50)),
        request.params().to_vec()
    );
}

#[test]
fn shared_cart_uses_the_v1_api() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::CartName, "nbia-49121659384603347")
        .unwrap();
    let request = QueryBuilder::build(Endpoint::SharedCart, &criteria, 100, None).unwrap();
    assert_eq!(request.endpoint().api_version(), "v1");
    assert_eq!(param(request.params(), "name"), Some("nbia-49121659384603347"));
}

#[test]
fn simple_search_renders_numbered_criteria_and_pages() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::Collection, "TCGA-BRCA")
        .unwrap()
        .with(FilterKey::Species, "human")
        .unwrap()
        .with(FilterKey::StudyDate, "2001/01/01..2002/06/30")
        .unwrap();
    let request = QueryBuilder::build(
        Endpoint::SimpleSearch,
        &criteria,
        25,
        Some(Sort::descending(Field::Collection)),
    )
    .unwrap();

    let params = request.params();
    assert_eq!(param(params, "criteriaType0"), Some("CollectionCriteria"));
    assert_eq!(param(params, "value0"), Some("TCGA-BRCA"));
    assert_eq!(param(params, "criteriaType1"), Some("SpeciesCriteria"));
    assert_eq!(param(params, "value1"), Some("337915000"));
    assert_eq!(param(params, "criteriaType2"), Some("DateRangeCriteria"));
    assert_eq!(param(params, "fromDate2"), Some("01-01-2001"));
    assert_eq!(param(params, "toDate2"), Some("06-30-2002"));
    assert_eq!(param(params, "sortField"), Some("collection"));
    assert_eq!(param(params, "sortDirection"), Some("descending"));

    let page = request.page_params(&PageCursor::Offset(50));
    assert_eq!(param(&page, "start"), Some("50"));
    assert_eq!(param(&page, "size"), Some("25"));
}

#[test]
fn page_size_is_bounded() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::Collection, "TCGA-BRCA")
        .unwrap();
    assert_matches!(
        QueryBuilder::build(Endpoint::SimpleSearch, &criteria, 0, None),
        Err(NbiaError::InvalidQuery(_))
    );
}

#[test]
fn endpoints_parse_by_path_or_alias() {
    assert_eq!("getSeries".parse::<Endpoint>().unwrap(), Endpoint::Series);
    assert_eq!("simple-search".parse::<Endpoint>().unwrap(), Endpoint::SimpleSearch);
    assert_eq!(
        "NewStudiesInPatientCollection".parse::<Endpoint>().unwrap(),
        Endpoint::NewStudies
    );
    assert_matches!("getNothing".parse::<Endpoint>(), Err(NbiaError::InvalidQuery(_)));
}

#[test]
fn sort_parses_field_and_direction() {
    let sort: Sort = "PatientID:desc".parse().unwrap();
    assert_eq!(sort, Sort::descending(Field::PatientId));
    let sort: Sort = "Number of images".parse().unwrap();
    assert_eq!(sort, Sort::ascending(Field::ImageCount));
}

#[test]
fn unset_modality_anded_is_not_sent() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::ModalityAnded, "false")
        .unwrap()
        .with(FilterKey::Collection, "TCGA-BRCA")
        .unwrap()
        .with(FilterKey::Modality, "MR")
        .unwrap();
    let request = QueryBuilder::build(Endpoint::SimpleSearch, &criteria, 25, None).unwrap();
    let params = request.params();

    assert!(params.iter().all(|(_, value)| value != "ModalityAndedSearchCriteria"));
    assert_eq!(param(params, "criteriaType0"), Some("CollectionCriteria"));
    assert_eq!(param(params, "criteriaType1"), Some("ImageModalityCriteria"));
    assert_eq!(param(params, "value1"), Some("MR"));
    assert_eq!(param(params, "criteriaType2"), None);
}

#[test]
fn set_modality_anded_is_numbered_after_the_collection() {
    let criteria = SearchCriteria::new()
        .with(FilterKey::Collection, "TCGA-BRCA")
        .unwrap()
        .with(FilterKey::ModalityAnded, "true")
        .unwrap();
    let request = QueryBuilder::build(Endpoint::SimpleSearch, &criteria, 25, None).unwrap();
    let params = request.params();

    assert_eq!(param(params, "criteriaType1"), Some("ModalityAndedSearchCriteria"));
    assert_eq!(param(params, "value1"), Some("all"));
}

#[test]
fn value_lists_may_run_unfiltered() {
    for endpoint in [
        Endpoint::Collections,
        Endpoint::Modalities,
        Endpoint::BodyParts,
        Endpoint::Manufacturers,
    ] {
        let request = QueryBuilder::build(endpoint, &SearchCriteria::new(), 100, None).unwrap();
        assert!(request.params().is_empty());
        assert!(!request.is_paged());
    }

    let criteria = SearchCriteria::new()
        .with(FilterKey::Collection, "LIDC-IDRI")
        .unwrap();
    let request = QueryBuilder::build(Endpoint::Modalities, &criteria, 100, None).unwrap();
    assert_eq!(request.granularity(), Granularity::Modality);
    assert_eq!(param(request.params(), "Collection"), Some("LIDC-IDRI"));
    assert_eq!(Endpoint::BodyParts.path(), "getBodyPartValues");
}

#[test]
fn per_series_endpoints_need_a_series_uid() {
    let series = "1.3.6.1.4.1.14519.5.2.1.7009.9004.1";
    for endpoint in [
        Endpoint::SeriesMetadata,
        Endpoint::SeriesSize,
        Endpoint::SopInstanceUids,
    ] {
        assert_matches!(
            QueryBuilder::build(endpoint, &SearchCriteria::new(), 100, None),
            Err(NbiaError::InvalidQuery(_))
        );
    }

    let criteria = SearchCriteria::new()
        .with(FilterKey::SeriesInstanceUid, series)
        .unwrap();
    let request = QueryBuilder::build(Endpoint::SopInstanceUids, &criteria, 100, None).unwrap();
    assert_eq!(request.granularity(), Granularity::Image);
    assert_eq!(
        request.context(),
        vec![(Field::SeriesInstanceUid, series.to_string())]
    );

    let request = QueryBuilder::build(Endpoint::Series, &criteria, 100, None).unwrap();
    assert!(request.context().is_empty());
    assert_eq!("metadata".parse::<Endpoint>().unwrap(), Endpoint::SeriesMetadata);
}
